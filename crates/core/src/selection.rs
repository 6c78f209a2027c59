//! Strict priority with a starvation guard.
//!
//! The highest non-empty class always wins, except that after `max_streak`
//! consecutive picks from one class the next-lower non-empty class gets a
//! single pick.

use serde::{Deserialize, Serialize};

use crate::job::Priority;

/// Streak bookkeeping persisted per queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreakState {
    pub class: Option<Priority>,
    pub streak: u32,
}

impl StreakState {
    /// State after picking `picked`.
    pub fn after_pick(&self, picked: Priority) -> StreakState {
        if self.class == Some(picked) {
            StreakState {
                class: Some(picked),
                streak: self.streak.saturating_add(1),
            }
        } else {
            StreakState {
                class: Some(picked),
                streak: 1,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StarvationGuard {
    /// Consecutive picks allowed before a lower class gets a turn; 0 disables the guard.
    pub max_streak: u32,
}

impl StarvationGuard {
    pub fn new(max_streak: u32) -> Self {
        Self { max_streak }
    }

    pub fn disabled() -> Self {
        Self { max_streak: 0 }
    }

    /// Choose a class among those with an eligible head.
    pub fn select(&self, state: &StreakState, available: &[Priority]) -> Option<Priority> {
        let highest = available.iter().copied().min()?;

        let streak_exhausted = self.max_streak > 0
            && state.class == Some(highest)
            && state.streak >= self.max_streak;
        if streak_exhausted {
            let next_lower = available.iter().copied().filter(|p| *p > highest).min();
            if let Some(lower) = next_lower {
                return Some(lower);
            }
        }

        Some(highest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(guard: StarvationGuard, mut counts: [usize; 3]) -> Vec<Priority> {
        let mut state = StreakState::default();
        let mut order = Vec::new();
        loop {
            let available: Vec<Priority> = Priority::ALL
                .iter()
                .copied()
                .filter(|p| counts[p.rank()] > 0)
                .collect();
            let Some(pick) = guard.select(&state, &available) else {
                break;
            };
            counts[pick.rank()] -= 1;
            state = state.after_pick(pick);
            order.push(pick);
        }
        order
    }

    #[test]
    fn low_gets_a_slot_after_streak() {
        use Priority::*;
        let order = drain(StarvationGuard::new(2), [3, 0, 1]);
        assert_eq!(order, vec![High, High, Low, High]);
    }

    #[test]
    fn strict_priority_without_guard() {
        use Priority::*;
        let order = drain(StarvationGuard::disabled(), [3, 0, 1]);
        assert_eq!(order, vec![High, High, High, Low]);
    }

    #[test]
    fn guard_yields_to_next_lower_class_only() {
        use Priority::*;
        let order = drain(StarvationGuard::new(1), [2, 1, 1]);
        assert_eq!(order, vec![High, Normal, High, Low]);
    }

    #[test]
    fn lone_class_keeps_being_served() {
        let guard = StarvationGuard::new(2);
        let state = StreakState {
            class: Some(Priority::High),
            streak: 10,
        };
        assert_eq!(guard.select(&state, &[Priority::High]), Some(Priority::High));
        assert_eq!(guard.select(&state, &[]), None);
    }
}
