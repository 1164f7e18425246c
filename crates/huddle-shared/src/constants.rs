/// Protocol version advertised on the health endpoint.
pub const PROTOCOL_VERSION: &str = "/huddle/1.0.0";

/// Default HTTP + websocket port (server)
pub const DEFAULT_HTTP_PORT: u16 = 3000;

/// Document collections.
pub const USERS_COLLECTION: &str = "users";
pub const GROUPS_COLLECTION: &str = "groups";
pub const REPORTED_USERS_COLLECTION: &str = "reportedUsers";

/// Pseudo-collection naming the channels embedded in every group.
pub const CHANNELS_COLLECTION: &str = "channels";

/// Maximum chat message length accepted on the relay (64 KiB)
pub const MAX_MESSAGE_SIZE: usize = 65_536;

/// Maximum size of one websocket frame accepted from a client (256 KiB)
pub const MAX_FRAME_SIZE: usize = 262_144;

/// Username of the account seeded into an empty store.
pub const SEED_SUPER_ADMIN_USERNAME: &str = "super";
