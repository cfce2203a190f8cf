use std::sync::{Arc, Mutex};

use aubstream_aub::CompareOp;
use aubstream_stream::{
    GatedMirrorStream, MirrorStream, Result, Stream, StreamError, StreamMode,
};
use aubstream_tbx::PciAddress;
use aubstream_types::{DataHint, MemoryBank, PageInfo};
use proptest::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Op {
    Mmio(u32, u32),
    ReadMmio(u32),
    Poll(u32),
    Memory(u64, Vec<u8>),
    ReadMemory(u64),
    Compare(u64),
    Gtt(u32, u64),
    Pci(u32),
    Comment(String),
    Close,
}

/// Stream that logs every call into a shared list.
struct Recording {
    mode: StreamMode,
    log: Arc<Mutex<Vec<Op>>>,
    fail_mmio: bool,
}

impl Recording {
    fn new(mode: StreamMode) -> (Self, Arc<Mutex<Vec<Op>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                mode,
                log: Arc::clone(&log),
                fail_mmio: false,
            },
            log,
        )
    }

    fn push(&self, op: Op) {
        self.log.lock().unwrap().push(op);
    }
}

impl Stream for Recording {
    fn stream_mode(&self) -> StreamMode {
        self.mode
    }

    fn write_mmio(&mut self, offset: u32, value: u32) -> Result<()> {
        self.push(Op::Mmio(offset, value));
        if self.fail_mmio {
            return Err(StreamError::CompareMismatch {
                address: offset as u64,
                op: CompareOp::Equal,
            });
        }
        Ok(())
    }

    fn read_mmio(&mut self, offset: u32) -> Result<u32> {
        self.push(Op::ReadMmio(offset));
        Ok(0xABCD)
    }

    fn register_poll(&mut self, offset: u32, _: u32, _: u32, _: bool, _: u8) -> Result<()> {
        self.push(Op::Poll(offset));
        Ok(())
    }

    fn write_memory(&mut self, pages: &[PageInfo], data: &[u8], _hint: DataHint) -> Result<()> {
        self.push(Op::Memory(pages[0].phys_address, data.to_vec()));
        Ok(())
    }

    fn read_memory(&mut self, pages: &[PageInfo], out: &mut [u8]) -> Result<()> {
        self.push(Op::ReadMemory(pages[0].phys_address));
        out.fill(0x5A);
        Ok(())
    }

    fn expect_memory(&mut self, pages: &[PageInfo], _: &[u8], _: CompareOp) -> Result<()> {
        self.push(Op::Compare(pages[0].phys_address));
        Ok(())
    }

    fn write_gtt(&mut self, index: u32, value: u64) -> Result<()> {
        self.push(Op::Gtt(index, value));
        Ok(())
    }

    fn write_pci_cfg(&mut self, _: PciAddress, offset: u32, _: u32) -> Result<()> {
        self.push(Op::Pci(offset));
        Ok(())
    }

    fn comment(&mut self, text: &str) -> Result<()> {
        self.push(Op::Comment(text.to_string()));
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.push(Op::Close);
        Ok(())
    }
}

fn page() -> [PageInfo; 1] {
    [PageInfo::new(0x1000, 4, MemoryBank::SYSTEM)]
}

fn ops(log: &Arc<Mutex<Vec<Op>>>) -> Vec<Op> {
    log.lock().unwrap().clone()
}

#[test]
fn mirror_fans_mutations_out_and_reads_from_live() {
    let (recorder, recorded) = Recording::new(StreamMode::AUB_FILE);
    let (live, lived) = Recording::new(StreamMode::TBX);
    let mut mirror = MirrorStream::new(recorder, live);
    assert_eq!(mirror.stream_mode(), StreamMode::AUB_FILE | StreamMode::TBX);

    mirror.write_mmio(0x2030, 1).unwrap();
    mirror
        .write_memory(&page(), b"data", DataHint::NONE)
        .unwrap();
    mirror.write_gtt(3, 0x1003).unwrap();
    assert_eq!(mirror.read_mmio(0x2034).unwrap(), 0xABCD);
    let mut buf = [0u8; 4];
    mirror.read_memory(&page(), &mut buf).unwrap();
    assert_eq!(buf, [0x5A; 4]);
    mirror.close().unwrap();

    let mutations = vec![
        Op::Mmio(0x2030, 1),
        Op::Memory(0x1000, b"data".to_vec()),
        Op::Gtt(3, 0x1003),
    ];
    let mut expected_recorder = mutations.clone();
    expected_recorder.push(Op::Close);
    assert_eq!(ops(&recorded), expected_recorder);

    let mut expected_live = mutations;
    expected_live.extend([Op::ReadMmio(0x2034), Op::ReadMemory(0x1000), Op::Close]);
    assert_eq!(ops(&lived), expected_live);
}

#[test]
fn paused_recorder_is_skipped() {
    let (recorder, recorded) = Recording::new(StreamMode::AUB_FILE);
    let (live, lived) = Recording::new(StreamMode::TBX);
    let mut gated = GatedMirrorStream::new(recorder, live);

    gated.comment("before").unwrap();
    gated.pause(true);
    assert_eq!(gated.stream_mode(), StreamMode::TBX);
    gated.comment("during").unwrap();
    gated.write_mmio(0x10, 2).unwrap();
    gated.pause(false);
    gated.comment("after").unwrap();

    assert_eq!(
        ops(&recorded),
        vec![Op::Comment("before".into()), Op::Comment("after".into())]
    );
    assert_eq!(
        ops(&lived),
        vec![
            Op::Comment("before".into()),
            Op::Comment("during".into()),
            Op::Mmio(0x10, 2),
            Op::Comment("after".into()),
        ]
    );
}

#[test]
fn blocked_memory_writes_only_stop_memory_contents() {
    let (recorder, recorded) = Recording::new(StreamMode::AUB_FILE);
    let (live, lived) = Recording::new(StreamMode::TBX);
    let mut gated = GatedMirrorStream::new(recorder, live);
    gated.block_memory_writes(true);
    assert!(gated.memory_writes_blocked());

    gated
        .write_memory(&page(), b"blob", DataHint::NONE)
        .unwrap();
    gated.write_mmio(0x20, 1).unwrap();
    gated.register_poll(0x24, 1, 1, false, 0).unwrap();
    gated
        .expect_memory(&page(), b"blob", CompareOp::Equal)
        .unwrap();
    gated.write_gtt(1, 0x2003).unwrap();
    gated
        .write_pci_cfg(PciAddress::new(0, 2, 0), 0x4, 6)
        .unwrap();

    assert_eq!(
        ops(&recorded),
        vec![
            Op::Memory(0x1000, b"blob".to_vec()),
            Op::Mmio(0x20, 1),
            Op::Poll(0x24),
            Op::Compare(0x1000),
            Op::Gtt(1, 0x2003),
            Op::Pci(0x4),
        ]
    );
    assert_eq!(
        ops(&lived),
        vec![
            Op::Mmio(0x20, 1),
            Op::Poll(0x24),
            Op::Compare(0x1000),
            Op::Gtt(1, 0x2003),
            Op::Pci(0x4),
        ]
    );
}

#[test]
fn live_side_still_runs_when_recorder_fails() {
    let (mut recorder, _) = Recording::new(StreamMode::AUB_FILE);
    recorder.fail_mmio = true;
    let (live, lived) = Recording::new(StreamMode::TBX);
    let mut mirror = MirrorStream::new(recorder, live);

    assert!(matches!(
        mirror.write_mmio(0x30, 9),
        Err(StreamError::CompareMismatch { address: 0x30, .. })
    ));
    assert_eq!(ops(&lived), vec![Op::Mmio(0x30, 9)]);
}

#[test]
fn recording_only_streams_reject_reads() {
    let (recorder, _) = Recording::new(StreamMode::AUB_FILE);
    let (live, _) = Recording::new(StreamMode::AUB_FILE);
    let mut mirror = MirrorStream::new(recorder, live);
    // Recording's own read_mmio answers; the default read_pci_cfg does not.
    assert!(matches!(
        mirror.read_pci_cfg(PciAddress::new(0, 0, 0), 0),
        Err(StreamError::Unsupported {
            operation: "read_pci_cfg",
            mode: StreamMode::AUB_FILE
        })
    ));
}

#[derive(Debug, Clone)]
enum Action {
    Pause(bool),
    Block(bool),
    Mmio(u32, u32),
    Memory(u16, u8),
    Gtt(u32, u64),
    Compare(u16),
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        any::<bool>().prop_map(Action::Pause),
        any::<bool>().prop_map(Action::Block),
        (any::<u32>(), any::<u32>()).prop_map(|(offset, value)| Action::Mmio(offset, value)),
        (any::<u16>(), any::<u8>()).prop_map(|(page, byte)| Action::Memory(page, byte)),
        (any::<u32>(), any::<u64>()).prop_map(|(index, value)| Action::Gtt(index, value)),
        any::<u16>().prop_map(Action::Compare),
    ]
}

proptest! {
    #[test]
    fn gated_mirror_follows_its_switches(actions in prop::collection::vec(action(), 0..48)) {
        let (recorder, recorded) = Recording::new(StreamMode::AUB_FILE);
        let (live, lived) = Recording::new(StreamMode::TBX);
        let mut gated = GatedMirrorStream::new(recorder, live);

        let mut expected_recorder = Vec::new();
        let mut expected_live = Vec::new();
        let (mut paused, mut blocked) = (false, false);
        for action in actions {
            let (op, is_memory) = match action {
                Action::Pause(on) => {
                    gated.pause(on);
                    paused = on;
                    continue;
                }
                Action::Block(on) => {
                    gated.block_memory_writes(on);
                    blocked = on;
                    continue;
                }
                Action::Mmio(offset, value) => {
                    gated.write_mmio(offset, value).unwrap();
                    (Op::Mmio(offset, value), false)
                }
                Action::Memory(page, byte) => {
                    let address = u64::from(page) << 12;
                    let pages = [PageInfo::new(address, 1, MemoryBank::SYSTEM)];
                    gated.write_memory(&pages, &[byte], DataHint::NONE).unwrap();
                    (Op::Memory(address, vec![byte]), true)
                }
                Action::Gtt(index, value) => {
                    gated.write_gtt(index, value).unwrap();
                    (Op::Gtt(index, value), false)
                }
                Action::Compare(page) => {
                    let address = u64::from(page) << 12;
                    let pages = [PageInfo::new(address, 1, MemoryBank::SYSTEM)];
                    gated.expect_memory(&pages, &[0], CompareOp::Equal).unwrap();
                    (Op::Compare(address), false)
                }
            };
            if !paused {
                expected_recorder.push(op.clone());
            }
            if !(is_memory && blocked) {
                expected_live.push(op);
            }
        }

        prop_assert_eq!(ops(&recorded), expected_recorder);
        prop_assert_eq!(ops(&lived), expected_live);
    }
}
