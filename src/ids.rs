//! Cluster-unique 64-bit id generation.
//!
//! Snowflake-style layout, most significant first:
//! 41 bits of milliseconds since [`EPOCH_MS`], 5 bits datacenter, 5 bits
//! machine, 2 bits generator kind, 10 bits sequence. The kind bits keep
//! message ids, task codes and batch ids disjoint even when minted in the
//! same millisecond on the same node.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::IdGenConfig;
use crate::error::{AppError, AppResult};

/// 2024-01-01T00:00:00Z.
const EPOCH_MS: i64 = 1_704_067_200_000;

const MAX_PARTITION: u8 = 31;
const SEQUENCE_BITS: u8 = 10;
const KIND_BITS: u8 = 2;
const MACHINE_BITS: u8 = 5;
const DATACENTER_BITS: u8 = 5;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;

const KIND_SHIFT: u8 = SEQUENCE_BITS;
const MACHINE_SHIFT: u8 = KIND_SHIFT + KIND_BITS;
const DATACENTER_SHIFT: u8 = MACHINE_SHIFT + MACHINE_BITS;
const TIMESTAMP_SHIFT: u8 = DATACENTER_SHIFT + DATACENTER_BITS;

/// Which concern an id is minted for. Encoded into the id so the three
/// streams never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Message = 0,
    Task = 1,
    Batch = 2,
}

#[derive(Debug)]
struct GeneratorState {
    last_ms: i64,
    sequence: i64,
}

/// Monotonic id source for a single [`IdKind`].
#[derive(Debug)]
pub struct IdGenerator {
    datacenter_id: i64,
    machine_id: i64,
    kind: IdKind,
    state: Mutex<GeneratorState>,
}

impl IdGenerator {
    fn new(datacenter_id: u8, machine_id: u8, kind: IdKind) -> AppResult<Self> {
        if datacenter_id > MAX_PARTITION {
            return Err(AppError::Config(format!(
                "datacenter id {datacenter_id} out of range 0..={MAX_PARTITION}"
            )));
        }
        if machine_id > MAX_PARTITION {
            return Err(AppError::Config(format!(
                "machine id {machine_id} out of range 0..={MAX_PARTITION}"
            )));
        }
        Ok(Self {
            datacenter_id: datacenter_id as i64,
            machine_id: machine_id as i64,
            kind,
            state: Mutex::new(GeneratorState {
                last_ms: 0,
                sequence: 0,
            }),
        })
    }

    /// Mint the next id. Strictly increasing for this generator within the
    /// process; unique across the cluster under correct partition
    /// assignment.
    pub fn next_id(&self) -> i64 {
        let mut state = self.state.lock().expect("id generator mutex poisoned");

        let mut now = Self::current_ms();
        // Never hand out a timestamp older than the last one we used; a
        // small clock regression degrades into sequence pressure instead.
        if now < state.last_ms {
            now = state.last_ms;
        }

        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // Sequence exhausted for this millisecond.
                while now <= state.last_ms {
                    now = Self::current_ms();
                }
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;

        ((now - EPOCH_MS) << TIMESTAMP_SHIFT)
            | (self.datacenter_id << DATACENTER_SHIFT)
            | (self.machine_id << MACHINE_SHIFT)
            | ((self.kind as i64) << KIND_SHIFT)
            | state.sequence
    }

    fn current_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as i64
    }
}

/// The process-wide set of generators, one per [`IdKind`]. Constructed at
/// boot and injected; construction validates the partition assignment.
#[derive(Debug)]
pub struct IdHub {
    messages: IdGenerator,
    tasks: IdGenerator,
    batches: IdGenerator,
}

impl IdHub {
    pub fn new(cfg: &IdGenConfig) -> AppResult<Self> {
        Ok(Self {
            messages: IdGenerator::new(cfg.datacenter_id, cfg.machine_id, IdKind::Message)?,
            tasks: IdGenerator::new(cfg.datacenter_id, cfg.machine_id, IdKind::Task)?,
            batches: IdGenerator::new(cfg.datacenter_id, cfg.machine_id, IdKind::Batch)?,
        })
    }

    pub fn next_message_id(&self) -> i64 {
        self.messages.next_id()
    }

    pub fn next_task_code(&self) -> i64 {
        self.tasks.next_id()
    }

    pub fn next_batch_id(&self) -> i64 {
        self.batches.next_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> IdHub {
        IdHub::new(&IdGenConfig {
            datacenter_id: 3,
            machine_id: 7,
        })
        .unwrap()
    }

    #[test]
    fn rejects_out_of_range_partitions() {
        assert!(IdHub::new(&IdGenConfig {
            datacenter_id: 32,
            machine_id: 0,
        })
        .is_err());
        assert!(IdHub::new(&IdGenConfig {
            datacenter_id: 0,
            machine_id: 200,
        })
        .is_err());
    }

    #[test]
    fn ids_strictly_increase() {
        let hub = hub();
        let mut prev = hub.next_message_id();
        for _ in 0..5000 {
            let next = hub.next_message_id();
            assert!(next > prev, "expected {next} > {prev}");
            prev = next;
        }
    }

    #[test]
    fn kinds_occupy_disjoint_bit_patterns() {
        let hub = hub();
        let msg = hub.next_message_id();
        let task = hub.next_task_code();
        let batch = hub.next_batch_id();

        let kind_of = |id: i64| (id >> KIND_SHIFT) & ((1 << KIND_BITS) - 1);
        assert_eq!(kind_of(msg), IdKind::Message as i64);
        assert_eq!(kind_of(task), IdKind::Task as i64);
        assert_eq!(kind_of(batch), IdKind::Batch as i64);
    }

    #[test]
    fn partition_bits_round_trip() {
        let hub = hub();
        let id = hub.next_task_code();
        assert_eq!((id >> DATACENTER_SHIFT) & 0x1f, 3);
        assert_eq!((id >> MACHINE_SHIFT) & 0x1f, 7);
    }
}
