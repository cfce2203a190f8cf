use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use aubstream_aub::{AddressSpace, AubReader, AubRecord};
use aubstream_paging::{map_range, AllocParams, EntryWrite, PageTable, DEFAULT_GGTT_SIZE};
use aubstream_phys::{PhysicalAllocator, SimplePhysicalAllocator, DEFAULT_BANK_SIZE};
use aubstream_stream::{
    write_mapped, GpuRegistry, Session, SessionConfig, SessionMode, StreamMode,
};
use aubstream_tbx::protocol::{Header, HEADER_LEN};
use aubstream_tbx::{Message, TbxConfig};
use aubstream_types::{BasicGpu, DataHint, GpuDescriptor, MemoryBank, PageInfo, ProductFamily};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn registry() -> GpuRegistry {
    let mut registry = GpuRegistry::with_basic_descriptors();
    let mut dg2 = BasicGpu::new(ProductFamily::Dg2);
    dg2.device_id = 0x56A0;
    dg2.local_banks = 1;
    dg2.abbreviation = Some(*b"dg2-g10\0");
    registry.register(Arc::new(dg2));
    registry
}

fn read_trace(path: &std::path::Path) -> Vec<AubRecord> {
    let bytes = std::fs::read(path).unwrap();
    AubReader::new(&bytes[..]).read_all().unwrap()
}

#[test]
fn five_entry_write_through_a_trace_session() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig {
        mode: SessionMode::Aub,
        aub_file: dir.path().join("five.aub"),
        ..SessionConfig::default()
    };
    let mut session = Session::open(&config, &registry(), ProductFamily::Dg2, 1).unwrap();

    let entries = [
        PageInfo::new(0x1_0000, 0x1000, MemoryBank::SYSTEM),
        PageInfo::new(0x2_0000, 0x1000, MemoryBank::SYSTEM),
        PageInfo::new(0x3_0000, 0x800, MemoryBank::SYSTEM),
        PageInfo::new(0x4_0001, 0x3FF, MemoryBank::SYSTEM),
        PageInfo::new(0x8_0000_0000, 0x1000, MemoryBank::local(0)),
    ];
    let total = PageInfo::total_size(&entries);
    let source: Vec<u8> = (0..total).map(|i| (i % 253) as u8).collect();
    session
        .stream()
        .write_memory(&entries, &source, DataHint::NONE)
        .unwrap();
    session.close().unwrap();

    let records = read_trace(&config.aub_file);
    assert_eq!(records.len(), 4);
    match &records[0] {
        AubRecord::Version {
            device_id,
            abbreviation,
            tag,
            ..
        } => {
            assert_eq!(*device_id, 0x56A0);
            assert_eq!(abbreviation, &Some(*b"dg2-g10\0"));
            assert_eq!(tag, b"DG2\0");
        }
        other => panic!("expected version record, got {other:?}"),
    }
    let aligned = 0x1000 + 0x1000 + 0x800;
    match &records[1] {
        AubRecord::MemoryWriteDiscontiguous { entries, data, .. } => {
            assert_eq!(entries.len(), 3);
            assert_eq!(data.as_slice(), &source[..aligned]);
        }
        other => panic!("expected discontiguous write, got {other:?}"),
    }
    match &records[2] {
        AubRecord::MemoryWrite { address, data, .. } => {
            assert_eq!(*address, 0x4_0001);
            assert_eq!(data.as_slice(), &source[aligned..aligned + 0x3FF]);
        }
        other => panic!("expected contiguous write, got {other:?}"),
    }
    match &records[3] {
        AubRecord::MemoryWrite {
            address,
            space,
            data,
            ..
        } => {
            assert_eq!(*address, 0x8_0000_0000);
            assert_eq!(*space, AddressSpace::Local);
            assert_eq!(data.as_slice(), &source[aligned + 0x3FF..]);
        }
        other => panic!("expected contiguous write, got {other:?}"),
    }
}

#[test]
fn ggtt_mapping_publishes_gtt_writes() {
    let gpu: Arc<dyn GpuDescriptor> = Arc::new(BasicGpu::new(ProductFamily::Tgl));
    let allocator: Arc<dyn PhysicalAllocator> =
        Arc::new(SimplePhysicalAllocator::new(0, DEFAULT_BANK_SIZE));
    let mut ggtt = PageTable::ggtt(Arc::clone(&gpu), Arc::clone(&allocator), DEFAULT_GGTT_SIZE);
    let mapping = map_range(
        &mut ggtt,
        0x3000,
        0x2000,
        MemoryBank::SYSTEM,
        AllocParams::default(),
    )
    .unwrap();
    assert!(mapping
        .entries
        .iter()
        .all(|entry| matches!(entry, EntryWrite::Gtt { .. })));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ggtt.aub");
    let mut stream =
        aubstream_stream::AubStream::create(&path, gpu.as_ref(), 0, Default::default()).unwrap();
    write_mapped(&mut stream, &mapping, &[0xEE; 0x2000], DataHint::NONE).unwrap();
    drop(stream);

    let gtt_slots: Vec<u64> = read_trace(&path)
        .iter()
        .filter_map(|record| match record {
            AubRecord::MemoryWrite {
                address,
                space: AddressSpace::GttEntry,
                ..
            } => Some(address / 8),
            _ => None,
        })
        .collect();
    assert_eq!(gtt_slots, vec![3, 4]);
}

/// Simulator stub: acknowledges everything, echoes markers and answers MMIO reads with a
/// fixed value. Returns the number of memory write messages it saw.
fn spawn_simulator() -> (u16, thread::JoinHandle<usize>) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let mut writes = 0;
        while let Some((header, message)) = next_message(&mut stream) {
            let reply = match message {
                Message::Mmio { write: false, .. } => Some(Message::MmioResponse { data: 0x1 }),
                Message::Marker { value } => Some(Message::MarkerResponse { value }),
                Message::WriteData { .. } | Message::WriteDataExt { .. } => {
                    writes += 1;
                    None
                }
                _ => None,
            };
            if let Some(reply) = reply {
                stream
                    .write_all(&reply.encode(header.trans_id).unwrap())
                    .unwrap();
            }
        }
        writes
    });
    (port, handle)
}

fn next_message(stream: &mut TcpStream) -> Option<(Header, Message)> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).ok()?;
    let header = Header::decode(&header);
    let mut body = vec![0u8; header.size as usize];
    stream.read_exact(&mut body).ok()?;
    Some((header, Message::decode(header.msg_type, &body).ok()?))
}

#[test]
fn combined_session_records_and_forwards() {
    init_tracing();
    let (port, simulator) = spawn_simulator();
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig {
        mode: SessionMode::AubTbx,
        aub_file: dir.path().join("combined.aub"),
        tbx: TbxConfig {
            port,
            connect_timeout: Duration::from_secs(5),
            ..TbxConfig::default()
        },
        ..SessionConfig::default()
    };
    let mut session = Session::open(&config, &registry(), ProductFamily::Dg2, 0).unwrap();
    assert_eq!(
        session.stream_mode(),
        StreamMode::AUB_FILE | StreamMode::TBX
    );

    let mut root = session.new_ppgtt(MemoryBank::local(0)).unwrap();
    let mapping = session
        .map_and_write(
            &mut root,
            0x20_0000,
            &[0xAB; 0x100],
            MemoryBank::local(0),
            AllocParams::default(),
            DataHint::BATCH_BUFFER,
        )
        .unwrap();
    let stream = session.stream();
    stream.write_mmio(0x2230, 0x1).unwrap();
    stream.register_poll(0x2234, 0x1, 0x1, false, 0).unwrap();
    assert_eq!(stream.read_mmio(0x2234).unwrap(), 0x1);
    session.close().unwrap();

    let forwarded = simulator.join().unwrap();
    assert_eq!(forwarded, mapping.entries.len() + mapping.pages.len());

    let records = read_trace(&config.aub_file);
    assert!(records.iter().any(|record| matches!(
        record,
        AubRecord::RegisterWrite {
            offset: 0x2230,
            value: 1,
            ..
        }
    )));
    assert!(records.iter().any(|record| matches!(
        record,
        AubRecord::RegisterPoll { offset: 0x2234, .. }
    )));
}
