//! Rate limiting logic and state management.

mod clock;
mod limiter;
mod pacing;
mod quota;
mod wrapper;

pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{Limiter, LimiterBuilder, Overrides};
pub use pacing::Pacing;
pub use quota::{History, Quota};
pub use wrapper::{
    ensure_limiter, get_limiter_state, has_limiter, placeholder, placeholder_async,
    set_limiter_state, strip_limiter, Limited, LimitedAsync, RateLimited, Wrapped,
};
