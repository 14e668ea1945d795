/// Application name
pub const APP_NAME: &str = "Agora";

/// Maximum display name length in characters
pub const MAX_DISPLAY_NAME_CHARS: usize = 32;

/// Maximum chat message length in characters
pub const MAX_MESSAGE_CHARS: usize = 5000;

/// Maximum number of custom stickers a single user may hold
pub const STICKER_CAP: usize = 60;

/// Maximum sticker description length in characters
pub const MAX_STICKER_DESCRIPTION_CHARS: usize = 120;

/// Length of a public file code
pub const FILE_CODE_LEN: usize = 8;

/// File code alphabet: 32 symbols, no 0/O or 1/I lookalikes
pub const FILE_CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Attempts at drawing a non-colliding file code before falling back to hex
pub const FILE_CODE_ATTEMPTS: usize = 5;

/// Grace window between a user's last connection dropping and the leave notice
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 3_500;

/// Write-behind coalescing window
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 50;

/// Messages per history page (initial snapshot and each history request)
pub const DEFAULT_HISTORY_PAGE_SIZE: usize = 50;

/// Version tag written into the persisted store document
pub const DOCUMENT_VERSION: u32 = 1;

/// Digits in a password-reset code
pub const RESET_CODE_DIGITS: usize = 6;

/// Wrong guesses allowed before a pending password reset is discarded
pub const MAX_RESET_ATTEMPTS: u32 = 5;

/// Default HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 8080;
