pub mod analyze;
pub mod observe;
pub mod services;
