//! 目标监管：取消令牌层级
//!
//! 运行时持有根 token；每个目标拿到根的子 token，每个步骤再拿目标 token 的子 token。
//! 取消目标只影响该目标及其在途步骤；关闭运行时（取消根）会级联到全部目标。

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::core::GoalId;

#[derive(Debug)]
pub struct GoalSupervisor {
    root: CancellationToken,
    goals: Mutex<HashMap<GoalId, CancellationToken>>,
}

impl GoalSupervisor {
    pub fn new(root: CancellationToken) -> Self {
        Self {
            root,
            goals: Mutex::new(HashMap::new()),
        }
    }

    pub fn root_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// 为目标创建子 token 并登记
    pub fn register(&self, goal_id: &str) -> CancellationToken {
        let token = self.root.child_token();
        self.goals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(goal_id.to_string(), token.clone());
        token
    }

    /// 触发目标取消；目标未登记（或已结束）时返回 false
    pub fn cancel(&self, goal_id: &str) -> bool {
        let goals = self.goals.lock().unwrap_or_else(|e| e.into_inner());
        match goals.get(goal_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// 目标结束后注销
    pub fn release(&self, goal_id: &str) {
        self.goals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(goal_id);
    }

    /// 关闭运行时：取消全部目标
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    pub fn active(&self) -> usize {
        self.goals.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for GoalSupervisor {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_scoped_to_goal() {
        let supervisor = GoalSupervisor::default();
        let a = supervisor.register("a");
        let b = supervisor.register("b");
        let step = a.child_token();

        assert!(supervisor.cancel("a"));
        assert!(a.is_cancelled());
        assert!(step.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(!supervisor.cancel("missing"));
    }

    #[test]
    fn test_shutdown_cascades_and_release() {
        let supervisor = GoalSupervisor::default();
        let a = supervisor.register("a");
        supervisor.release("a");
        assert_eq!(supervisor.active(), 0);
        assert!(!supervisor.cancel("a"));

        supervisor.shutdown();
        assert!(a.is_cancelled());
    }
}
