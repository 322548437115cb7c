pub mod clock;
pub mod external_apis;
pub mod models;
