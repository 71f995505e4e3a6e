//! Periodic tasks driven by virtual time. The host calls `advance` with elapsed time;
//! tests advance it by hand.

use std::time::Duration;

/// Periodic work the node performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Task {
    SchedulePieces,
    DialPeers,
    HeartBeat,
    ReportUtility,
    ExpireRequests,
}

#[derive(Debug)]
struct Repeater {
    task: Task,
    interval: Duration,
    next_due: Duration,
}

#[derive(Debug, Default)]
pub struct Timers {
    now: Duration,
    repeaters: Vec<Repeater>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `task` to run every `interval`, first on the next `advance`.
    /// Re-registering a task replaces its interval.
    pub fn register(&mut self, task: Task, interval: Duration) {
        self.repeaters.retain(|r| r.task != task);
        self.repeaters.push(Repeater {
            task,
            interval,
            next_due: self.now,
        });
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    /// Move virtual time forward. Each due task is returned once, in registration order,
    /// even if several of its periods elapsed.
    pub fn advance(&mut self, elapsed: Duration) -> Vec<Task> {
        self.now += elapsed;
        let now = self.now;
        let mut due = Vec::new();
        for r in &mut self.repeaters {
            if r.next_due <= now {
                due.push(r.task);
                r.next_due = now + r.interval;
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_tasks_fire_on_first_advance() {
        let mut t = Timers::new();
        t.register(Task::DialPeers, Duration::from_secs(5));
        t.register(Task::HeartBeat, Duration::from_secs(30));
        assert_eq!(
            t.advance(Duration::ZERO),
            vec![Task::DialPeers, Task::HeartBeat]
        );
        assert!(t.advance(Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn fires_each_interval() {
        let mut t = Timers::new();
        t.register(Task::SchedulePieces, Duration::from_millis(500));
        t.advance(Duration::ZERO);
        assert!(t.advance(Duration::from_millis(499)).is_empty());
        assert_eq!(t.advance(Duration::from_millis(1)), vec![Task::SchedulePieces]);
    }

    #[test]
    fn missed_periods_collapse() {
        let mut t = Timers::new();
        t.register(Task::ReportUtility, Duration::from_secs(1));
        t.advance(Duration::ZERO);
        assert_eq!(t.advance(Duration::from_secs(10)), vec![Task::ReportUtility]);
        assert!(t.advance(Duration::from_millis(999)).is_empty());
    }

    #[test]
    fn reregister_replaces_interval() {
        let mut t = Timers::new();
        t.register(Task::DialPeers, Duration::from_secs(5));
        t.advance(Duration::ZERO);
        t.register(Task::DialPeers, Duration::from_secs(1));
        assert_eq!(t.advance(Duration::ZERO), vec![Task::DialPeers]);
        assert!(t.advance(Duration::from_millis(999)).is_empty());
        assert_eq!(t.advance(Duration::from_millis(1)), vec![Task::DialPeers]);
        assert_eq!(t.now(), Duration::from_secs(1));
    }
}
