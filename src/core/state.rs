//! Dispatcher 状态机
//!
//! Received → ContextAssembled → PlanRequested → {PlanValid, PlanFailed} → Executing → Responding → Done。
//! PlanFailed 之后走启发式降级，但仍然经过 Executing / Responding；任何状态都可以直接进入 Done。

use serde::Serialize;

/// 单次交互的处理阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    Received,
    ContextAssembled,
    PlanRequested,
    PlanValid,
    PlanFailed,
    Executing,
    Responding,
    Done,
}

impl DispatchState {
    /// 是否允许从 self 迁移到 next
    pub fn can_transition_to(self, next: DispatchState) -> bool {
        use DispatchState::*;
        if next == Done {
            return self != Done;
        }
        matches!(
            (self, next),
            (Received, ContextAssembled)
                | (ContextAssembled, PlanRequested)
                | (PlanRequested, PlanValid)
                | (PlanRequested, PlanFailed)
                | (PlanValid, Executing)
                | (PlanFailed, Executing)
                | (Executing, Responding)
        )
    }
}

/// 状态轨迹：记录一次交互经过的所有状态，非法迁移被忽略并告警
#[derive(Clone, Debug, Serialize)]
pub struct StateTrace {
    states: Vec<DispatchState>,
}

impl StateTrace {
    pub fn new() -> Self {
        Self {
            states: vec![DispatchState::Received],
        }
    }

    pub fn current(&self) -> DispatchState {
        *self.states.last().unwrap_or(&DispatchState::Received)
    }

    /// 迁移到下一个状态；返回是否成功
    pub fn advance(&mut self, next: DispatchState) -> bool {
        let current = self.current();
        if current.can_transition_to(next) {
            tracing::debug!(from = ?current, to = ?next, "dispatch state");
            self.states.push(next);
            true
        } else {
            tracing::warn!(from = ?current, to = ?next, "illegal dispatch state transition ignored");
            false
        }
    }

    pub fn states(&self) -> &[DispatchState] {
        &self.states
    }

    pub fn visited(&self, state: DispatchState) -> bool {
        self.states.contains(&state)
    }
}

impl Default for StateTrace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut trace = StateTrace::new();
        for s in [
            DispatchState::ContextAssembled,
            DispatchState::PlanRequested,
            DispatchState::PlanValid,
            DispatchState::Executing,
            DispatchState::Responding,
            DispatchState::Done,
        ] {
            assert!(trace.advance(s), "transition to {s:?} rejected");
        }
        assert_eq!(trace.current(), DispatchState::Done);
        assert_eq!(trace.states().len(), 7);
    }

    #[test]
    fn test_plan_failed_goes_through_execution() {
        let mut trace = StateTrace::new();
        trace.advance(DispatchState::ContextAssembled);
        trace.advance(DispatchState::PlanRequested);
        assert!(trace.advance(DispatchState::PlanFailed));
        assert!(trace.advance(DispatchState::Executing));
        assert!(trace.visited(DispatchState::PlanFailed));
        assert!(!trace.visited(DispatchState::PlanValid));
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut trace = StateTrace::new();
        assert!(!trace.advance(DispatchState::Executing));
        assert_eq!(trace.current(), DispatchState::Received);
    }

    #[test]
    fn test_done_reachable_from_anywhere_once() {
        let mut trace = StateTrace::new();
        trace.advance(DispatchState::ContextAssembled);
        assert!(trace.advance(DispatchState::Done));
        assert!(!trace.advance(DispatchState::Done));
    }
}
