//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了请求调用方的身份信息。

/// 调用方上下文
///
/// 由上层（如HTTP拦截器）在鉴权后构造，并显式传给需要用户身份的操作。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallerContext {
    pub user_id: u64,
}

impl CallerContext {
    pub fn new(user_id: u64) -> Self {
        Self { user_id }
    }
}
