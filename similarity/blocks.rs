// ========================================================================================
//
//                           THE BLOCK PIPELINE & COMMIT GATE
//
// ========================================================================================
//
// A device worker keeps several blocks in flight. Each block cycles through
//
//     Start -> Load -> Execute -> Read -> Start ... -> Done
//
// Start stages the next batch of pairs and begins the upload, Load launches the kernel
// chain once the upload is finished, Execute begins the download once the kernels are
// finished, and Read hands the results over. Blocks complete out of order, so Read
// only commits when the block's first pair is the next pair the gate expects; until
// then the block stays parked in Read, holding its buffers.

use crate::device::{ComputeDevice, DeviceError, DeviceEvent};
use crate::pairwise::{PairIndex, PairRange};
use crate::pipeline::{PipelineError, Worker};
use crate::types::{ResultBlock, WorkBlock};
use log::trace;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Releases items strictly in the order of their starting position.
#[derive(Debug)]
pub struct CommitGate<T> {
    next: i64,
    parked: BTreeMap<i64, (i64, T)>,
}

impl<T> CommitGate<T> {
    pub fn new(start: i64) -> Self {
        Self {
            next: start,
            parked: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn next_expected(&self) -> i64 {
        self.next
    }

    #[inline]
    pub fn is_next(&self, start: i64) -> bool {
        start == self.next
    }

    /// Moves the gate past `len` positions that were committed directly.
    pub fn advance(&mut self, len: i64) {
        self.next += len;
    }

    /// Accepts an item covering `len` positions from `start` and returns every item
    /// that can now be committed, in order.
    pub fn offer(&mut self, start: i64, len: i64, item: T) -> Vec<T> {
        debug_assert!(start >= self.next, "item at {start} offered after gate passed it");
        self.parked.insert(start, (len, item));
        let mut ready = Vec::new();
        while let Some((len, item)) = self.parked.remove(&self.next) {
            self.next += len;
            ready.push(item);
        }
        ready
    }

    /// Items waiting for an earlier position.
    pub fn parked(&self) -> usize {
        self.parked.len()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    Start,
    Load,
    Execute,
    Read,
    Done,
}

struct Block<D: ComputeDevice> {
    slot: D::Slot,
    state: BlockState,
    /// Ordinal of the first staged pair.
    start: i64,
    count: usize,
    event: Option<D::Event>,
}

impl<D: ComputeDevice> Block<D> {
    fn event_complete(&self) -> Result<bool, DeviceError> {
        match &self.event {
            Some(event) => event.is_complete(),
            None => Ok(true),
        }
    }
}

/// Drives a [`ComputeDevice`] over work units with several blocks in flight.
pub struct BlockPipeline<D: ComputeDevice> {
    device: D,
    blocks: Vec<Block<D>>,
    kernel_size: usize,
    staged: Vec<PairIndex>,
}

impl<D: ComputeDevice> BlockPipeline<D> {
    pub fn new(mut device: D, block_count: usize, kernel_size: usize) -> Result<Self, DeviceError> {
        let kernel_size = kernel_size.max(1);
        let mut blocks = Vec::with_capacity(block_count.max(1));
        for _ in 0..block_count.max(1) {
            blocks.push(Block {
                slot: device.create_slot(kernel_size)?,
                state: BlockState::Done,
                start: 0,
                count: 0,
                event: None,
            });
        }
        Ok(Self {
            device,
            blocks,
            kernel_size,
            staged: Vec::with_capacity(kernel_size),
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Computes every pair of `work`. Returns `None` if `interrupt` was raised; blocks
    /// already in flight are drained first.
    pub fn execute(
        &mut self,
        work: &WorkBlock,
        interrupt: &AtomicBool,
    ) -> Result<Option<ResultBlock>, PipelineError> {
        let end = work.start + work.size;
        let mut next_pair = work.start;
        let mut gate: CommitGate<()> = CommitGate::new(work.start);
        let mut output = ResultBlock::new(work);
        let mut interrupted = false;

        for block in &mut self.blocks {
            block.state = BlockState::Start;
            block.event = None;
        }

        loop {
            let mut all_done = true;
            let mut progressed = false;
            if !interrupted && interrupt.load(Ordering::Relaxed) {
                interrupted = true;
            }

            for (b, block) in self.blocks.iter_mut().enumerate() {
                let before = block.state;
                match block.state {
                    BlockState::Start => {
                        if interrupted || next_pair >= end {
                            block.state = BlockState::Done;
                        } else {
                            let count = (end - next_pair).min(self.kernel_size as i64);
                            self.staged.clear();
                            self.staged
                                .extend(PairRange::from_ordinal(next_pair, count as u64)?);
                            block.start = next_pair;
                            block.count = count as usize;
                            next_pair += count;
                            block.event = Some(self.device.upload(&mut block.slot, &self.staged)?);
                            block.state = BlockState::Load;
                        }
                    }
                    BlockState::Load => {
                        if block.event_complete()? {
                            block.event = Some(self.device.launch(&mut block.slot)?);
                            block.state = BlockState::Execute;
                        }
                    }
                    BlockState::Execute => {
                        if block.event_complete()? {
                            block.event = Some(self.device.download(&mut block.slot)?);
                            block.state = BlockState::Read;
                        }
                    }
                    BlockState::Read => {
                        if block.event_complete()? && gate.is_next(block.start) {
                            self.device.collect(&mut block.slot, &mut output.pairs)?;
                            gate.advance(block.count as i64);
                            block.event = None;
                            block.state = BlockState::Start;
                        }
                    }
                    BlockState::Done => {}
                }
                if block.state != before {
                    progressed = true;
                    trace!("block {b}: {before:?} -> {:?} at pair {}", block.state, block.start);
                }
                if block.state != BlockState::Done {
                    all_done = false;
                }
            }

            if all_done {
                break;
            }
            if !progressed {
                std::thread::yield_now();
            }
        }

        if interrupted && gate.next_expected() < end {
            return Ok(None);
        }
        Ok(Some(output))
    }
}

impl<D: ComputeDevice> Worker for BlockPipeline<D> {
    fn name(&self) -> &'static str {
        self.device.name()
    }

    fn compute(
        &mut self,
        work: &WorkBlock,
        interrupt: &AtomicBool,
    ) -> Result<Option<ResultBlock>, PipelineError> {
        self.execute(work, interrupt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PairResult;
    use std::cell::Cell;

    /// Completes after a fixed number of polls.
    struct Countdown(Cell<u32>);

    impl DeviceEvent for Countdown {
        fn is_complete(&self) -> Result<bool, DeviceError> {
            let left = self.0.get();
            if left == 0 {
                return Ok(true);
            }
            self.0.set(left - 1);
            Ok(false)
        }
    }

    struct ScriptedSlot {
        id: usize,
        capacity: usize,
        pairs: Vec<PairIndex>,
    }

    /// Each slot answers after its own delay, so later blocks overtake earlier ones.
    struct Scripted {
        delays: Vec<u32>,
        created: usize,
    }

    impl ComputeDevice for Scripted {
        type Slot = ScriptedSlot;
        type Event = Countdown;

        fn name(&self) -> &'static str {
            "scripted"
        }

        fn create_slot(&mut self, capacity: usize) -> Result<ScriptedSlot, DeviceError> {
            self.created += 1;
            Ok(ScriptedSlot {
                id: self.created - 1,
                capacity,
                pairs: Vec::new(),
            })
        }

        fn upload(&mut self, slot: &mut ScriptedSlot, pairs: &[PairIndex]) -> Result<Countdown, DeviceError> {
            if pairs.len() > slot.capacity {
                return Err(DeviceError::Capacity {
                    count: pairs.len(),
                    capacity: slot.capacity,
                });
            }
            slot.pairs = pairs.to_vec();
            Ok(Countdown(Cell::new(self.delays[slot.id])))
        }

        fn launch(&mut self, slot: &mut ScriptedSlot) -> Result<Countdown, DeviceError> {
            Ok(Countdown(Cell::new(self.delays[slot.id])))
        }

        fn download(&mut self, slot: &mut ScriptedSlot) -> Result<Countdown, DeviceError> {
            Ok(Countdown(Cell::new(self.delays[slot.id])))
        }

        fn collect(&mut self, slot: &mut ScriptedSlot, out: &mut Vec<PairResult>) -> Result<(), DeviceError> {
            out.extend(slot.pairs.iter().map(|pair| PairResult {
                k: 1,
                labels: Vec::new(),
                correlations: vec![pair.ordinal() as f32],
            }));
            Ok(())
        }
    }

    #[test]
    fn results_commit_in_pair_order_despite_uneven_blocks() -> Result<(), Box<dyn std::error::Error>> {
        let device = Scripted {
            delays: vec![7, 0, 3],
            created: 0,
        };
        let mut pipeline = BlockPipeline::new(device, 3, 3)?;
        let work = WorkBlock {
            index: 2,
            start: 5,
            size: 11,
        };
        let result = pipeline
            .execute(&work, &AtomicBool::new(false))?
            .ok_or("unexpected interruption")?;

        assert_eq!(result.index, 2);
        assert_eq!(result.start, 5);
        let ordinals: Vec<f32> = result.pairs.iter().map(|p| p.correlations[0]).collect();
        let expected: Vec<f32> = (5..16).map(|o| o as f32).collect();
        assert_eq!(ordinals, expected);
        Ok(())
    }

    #[test]
    fn pipeline_is_reusable_across_units() -> Result<(), Box<dyn std::error::Error>> {
        let device = Scripted {
            delays: vec![1, 2],
            created: 0,
        };
        let mut pipeline = BlockPipeline::new(device, 2, 4)?;
        for (index, start) in [(0usize, 0i64), (1, 9)] {
            let work = WorkBlock { index, start, size: 9 };
            let result = pipeline
                .compute(&work, &AtomicBool::new(false))?
                .ok_or("unexpected interruption")?;
            assert_eq!(result.pairs.len(), 9);
            assert_eq!(result.pairs[0].correlations[0], start as f32);
        }
        assert_eq!(pipeline.device().created, 2);
        Ok(())
    }

    #[test]
    fn raised_interrupt_abandons_the_unit() -> Result<(), Box<dyn std::error::Error>> {
        let device = Scripted {
            delays: vec![0],
            created: 0,
        };
        let mut pipeline = BlockPipeline::new(device, 1, 8)?;
        let work = WorkBlock {
            index: 0,
            start: 0,
            size: 20,
        };
        assert!(pipeline.execute(&work, &AtomicBool::new(true))?.is_none());
        Ok(())
    }

    #[test]
    fn gate_releases_in_start_order() {
        let mut gate = CommitGate::new(10);
        assert!(gate.offer(14, 3, "c").is_empty());
        assert!(gate.offer(12, 2, "b").is_empty());
        assert_eq!(gate.parked(), 2);
        assert_eq!(gate.offer(10, 2, "a"), vec!["a", "b", "c"]);
        assert_eq!(gate.next_expected(), 17);
        assert_eq!(gate.parked(), 0);
        assert_eq!(gate.offer(17, 1, "d"), vec!["d"]);
    }

    #[test]
    fn gate_advances_on_direct_commits() {
        let mut gate: CommitGate<()> = CommitGate::new(0);
        assert!(gate.is_next(0));
        gate.advance(4096);
        assert!(!gate.is_next(0));
        assert!(gate.is_next(4096));
    }
}
