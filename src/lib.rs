pub mod captcha;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod locator;
pub mod popup;
pub mod progress;
pub mod report;
pub mod session;
pub mod staging;
pub mod surface;
pub mod task;
pub mod wait;
pub mod workflow;
