mod audit;
mod csrf;
mod health;
mod posts;

pub use audit::recent_events;
pub use csrf::{get_token, rotate_token};
pub use health::{health_check, readiness_check};
pub use posts::{create_post, list_posts};
