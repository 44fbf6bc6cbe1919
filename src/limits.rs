// Input bounds enforced at the engine surface.

pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_COLOR_LEN: usize = 32;
pub const MAX_NOTES_LEN: usize = 2_000;
pub const MAX_FEEDBACK_LEN: usize = 4_000;
pub const MAX_REASON_LEN: usize = 500;

/// Upper bound on `Repeating::interval`.
pub const MAX_REPEAT_INTERVAL: u32 = 52;

pub const MAX_RULES_PER_TEACHER: usize = 1_000;

/// Widest window `list_occurrences` / `bookable_occurrences` will expand.
pub const MAX_EXPANSION_WINDOW_DAYS: i64 = 732;

pub const MAX_CREDIT_GRANT: u32 = 1_000;
