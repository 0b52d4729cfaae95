//! The messages between the coordinator and the worker groups.
use serde::{Deserialize, Serialize};

/// The tag a pool message is sent with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    /// A worker group asks for a task
    Ready = 0,
    /// A worker group reports the result of a task
    Done = 1,
    /// Sent by the coordinator when there is no more work, and echoed by the
    /// worker group as it shuts down
    Exit = 2,
    /// The coordinator hands a task to a worker group
    Start = 3,
}

impl Tag {
    pub fn id(self) -> u32 {
        self as u32
    }
}

/// A message of the pool protocol, for tasks of type `T` with results of
/// type `R`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PoolMsg<T, R> {
    Ready,
    Start { index: usize, task: T },
    Done { index: usize, result: R },
    Exit,
}

impl<T, R> PoolMsg<T, R> {
    pub fn tag(&self) -> Tag {
        match self {
            PoolMsg::Ready => Tag::Ready,
            PoolMsg::Start { .. } => Tag::Start,
            PoolMsg::Done { .. } => Tag::Done,
            PoolMsg::Exit => Tag::Exit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_match_the_wire_numbers() {
        assert_eq!(Tag::Ready.id(), 0);
        assert_eq!(Tag::Done.id(), 1);
        assert_eq!(Tag::Exit.id(), 2);
        assert_eq!(Tag::Start.id(), 3);
        let msg: PoolMsg<String, ()> = PoolMsg::Start {
            index: 4,
            task: "x".to_string(),
        };
        assert_eq!(msg.tag(), Tag::Start);
    }
}
