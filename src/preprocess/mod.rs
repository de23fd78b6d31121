//! 入站请求预处理
//!
//! 在路由与翻译之前整形请求，减少上游把一次交换计为新的用户请求。

pub mod chat;
pub mod messages;
pub mod responses;

pub use messages::{preprocess, Preprocessed};
