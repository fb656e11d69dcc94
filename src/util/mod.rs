mod align;
pub use align::*;

mod rate_limit;
pub use rate_limit::*;
