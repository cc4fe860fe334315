use std::io::{self, Write};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressState {
    pub total_size: u64,
    pub bytes_read: u64,
}

impl ProgressState {
    pub fn new(total_size: u64) -> Self {
        Self {
            total_size,
            bytes_read: 0,
        }
    }

    pub fn percentage(&self) -> f64 {
        if self.total_size == 0 {
            return 100.0;
        }
        self.bytes_read as f64 / self.total_size as f64 * 100.0
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_read == self.total_size
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ProgressEvent {
    Advanced {
        bytes_read: u64,
        total_size: u64,
        percentage: f64,
    },
    Completed {
        total_size: u64,
    },
}

pub trait ProgressObserver {
    fn notify(&mut self, event: ProgressEvent);
}

impl<F> ProgressObserver for F
where
    F: FnMut(ProgressEvent),
{
    fn notify(&mut self, event: ProgressEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {
    fn notify(&mut self, _event: ProgressEvent) {}
}

#[derive(Debug, Clone, Default)]
pub struct TracingObserver {
    pub label: String,
}

impl TracingObserver {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl ProgressObserver for TracingObserver {
    fn notify(&mut self, event: ProgressEvent) {
        match event {
            ProgressEvent::Advanced {
                bytes_read,
                total_size,
                percentage,
            } => debug!(
                upload = %self.label,
                bytes_read,
                total_size,
                percentage,
                "upload in progress"
            ),
            ProgressEvent::Completed { total_size } => {
                info!(upload = %self.label, total_size, "upload copy complete")
            }
        }
    }
}

pub struct ProgressTee<'a, O: ProgressObserver + ?Sized> {
    state: ProgressState,
    completed: bool,
    observer: &'a mut O,
}

impl<'a, O: ProgressObserver + ?Sized> ProgressTee<'a, O> {
    pub fn new(total_size: u64, observer: &'a mut O) -> Self {
        Self {
            state: ProgressState::new(total_size),
            completed: false,
            observer,
        }
    }

    pub fn state(&self) -> ProgressState {
        self.state
    }

    pub fn completed(&self) -> bool {
        self.completed
    }

    fn record(&mut self, len: usize) {
        self.state.bytes_read = self.state.bytes_read.saturating_add(len as u64);
        if self.state.is_complete() {
            if !self.completed {
                self.completed = true;
                self.observer.notify(ProgressEvent::Completed {
                    total_size: self.state.total_size,
                });
            }
            return;
        }

        self.observer.notify(ProgressEvent::Advanced {
            bytes_read: self.state.bytes_read,
            total_size: self.state.total_size,
            percentage: self.state.percentage(),
        });
    }
}

impl<O: ProgressObserver + ?Sized> Write for ProgressTee<'_, O> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.record(buf.len());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{ProgressEvent, ProgressObserver, ProgressState, ProgressTee};

    #[test]
    fn percentage_tracks_bytes_read() {
        let mut state = ProgressState::new(8);
        state.bytes_read = 2;
        assert_eq!(state.percentage(), 25.0);
        assert!(!state.is_complete());
        state.bytes_read = 8;
        assert!(state.is_complete());
    }

    #[test]
    fn completion_fires_exactly_once() {
        let mut events = Vec::new();
        let mut observer = |event: ProgressEvent| events.push(event);
        let mut tee = ProgressTee::new(9, &mut observer);

        tee.write_all(b"a,b\n").expect("write");
        tee.write_all(b"1,2\n").expect("write");
        tee.write_all(b"\n").expect("write");
        tee.write_all(b"").expect("write");
        let state = tee.state();
        assert!(tee.completed());
        drop(tee);

        assert_eq!(state.bytes_read, state.total_size);
        let completions = events
            .iter()
            .filter(|event| matches!(event, ProgressEvent::Completed { .. }))
            .count();
        assert_eq!(completions, 1);
        assert_eq!(
            events.first(),
            Some(&ProgressEvent::Advanced {
                bytes_read: 4,
                total_size: 9,
                percentage: 4.0 / 9.0 * 100.0,
            })
        );
        assert_eq!(events.last(), Some(&ProgressEvent::Completed { total_size: 9 }));
    }

    #[test]
    fn tee_accepts_any_observer_behind_a_trait_object() {
        let mut count = 0usize;
        let mut observer = |_event: ProgressEvent| count += 1;
        let dynamic: &mut dyn ProgressObserver = &mut observer;
        let mut tee = ProgressTee::new(3, dynamic);
        assert_eq!(tee.write(b"abc").expect("write"), 3);
        drop(tee);
        assert_eq!(count, 1);
    }

    #[test]
    fn events_serialize_with_a_phase_tag() {
        let encoded =
            serde_json::to_value(ProgressEvent::Completed { total_size: 9 }).expect("encode");
        assert_eq!(encoded["phase"], "completed");
        assert_eq!(encoded["total_size"], 9);
    }
}
