/// Size of a disk sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Size of a user/kernel page in bytes.
pub const PGSIZE: usize = 4096;

/// Sectors backing one page; the width of a swap slot.
pub const SECTORS_PER_PAGE: usize = PGSIZE / SECTOR_SIZE;

/// Open files per process. Slots 0 and 1 are the console.
pub const NOFILE: usize = 128;

/// Maximum length of a single path component.
pub const NAME_MAX: usize = 14;

/// Maximum file path name.
pub const MAXPATH: usize = 128;

/// Max exec arguments.
pub const MAXARG: usize = 64;

/// Maximum length of a thread name.
pub const MAXTHREADNAME: usize = 16;

/// Symlink dereferences tolerated in one path walk.
pub const SYMLOOP_MAX: usize = 8;

/// Lowest thread priority.
pub const PRI_MIN: i32 = 0;

/// Default thread priority.
pub const PRI_DEFAULT: i32 = 31;

/// Highest thread priority.
pub const PRI_MAX: i32 = 63;

/// Lowest niceness.
pub const NICE_MIN: i32 = -20;

/// Default niceness.
pub const NICE_DEFAULT: i32 = 0;

/// Highest niceness.
pub const NICE_MAX: i32 = 20;

/// Timer ticks per second.
pub const TIMER_FREQ: i64 = 100;

/// Timer ticks each thread may run before preemption.
pub const TIME_SLICE: i64 = 4;
