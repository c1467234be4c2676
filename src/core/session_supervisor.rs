//! 会话监管：生命周期、中断管理
//!
//! 持有根 CancellationToken；每次运行领取一个子 token，用户 Ctrl+C 只取消当前运行，
//! shutdown 取消根 token 结束整个会话。

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

/// 会话级生命周期管理：根取消令牌 + 当前运行的子令牌
#[derive(Debug)]
pub struct SessionSupervisor {
    root: CancellationToken,
    current: Mutex<Option<CancellationToken>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            current: Mutex::new(None),
        }
    }

    /// 为新的一次运行创建子 token，并替换之前的
    pub fn begin_run(&self) -> CancellationToken {
        let token = self.root.child_token();
        let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        *current = Some(token.clone());
        token
    }

    /// 取消当前运行（用户 Ctrl+C）；返回是否确有运行被取消
    pub fn cancel_current(&self) -> bool {
        let current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        match current.as_ref() {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// 结束会话：取消根 token 及所有子 token
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.root.is_cancelled()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_only_current_run() {
        let supervisor = SessionSupervisor::new();
        let first = supervisor.begin_run();
        assert!(supervisor.cancel_current());
        assert!(first.is_cancelled());
        assert!(!supervisor.cancel_current());

        let second = supervisor.begin_run();
        assert!(!second.is_cancelled());
    }

    #[test]
    fn test_shutdown_cancels_children() {
        let supervisor = SessionSupervisor::new();
        let run = supervisor.begin_run();
        supervisor.shutdown();
        assert!(run.is_cancelled());
        assert!(supervisor.is_shut_down());
    }
}
