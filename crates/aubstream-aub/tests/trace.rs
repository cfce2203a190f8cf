use std::fs::File;
use std::io::BufReader;

use aubstream_aub::{
    split_header, AddressSpace, AubReader, AubRecord, AubWriter, CompareOp, ContextDeclaration,
    SurfaceDump, AUB_FILE_VERSION,
};
use aubstream_types::{BasicGpu, DataHint, FailurePolicy, MemoryBank, PageInfo, ProductFamily};
use proptest::prelude::*;

fn gpu() -> BasicGpu {
    let mut gpu = BasicGpu::new(ProductFamily::Dg2);
    gpu.device_id = 0x56A0;
    gpu.local_banks = 1;
    gpu
}

fn records(bytes: &[u8]) -> Vec<AubRecord> {
    AubReader::new(bytes).read_all().unwrap()
}

/// Applies every memory write in `records` to a sparse byte map.
fn replay(records: &[AubRecord]) -> Vec<(u64, u8)> {
    let mut out = Vec::new();
    for record in records {
        match record {
            AubRecord::MemoryWrite { address, data, .. } => {
                out.extend(data.iter().enumerate().map(|(i, &b)| (address + i as u64, b)));
            }
            AubRecord::MemoryWriteDiscontiguous { entries, data, .. } => {
                let mut offset = 0usize;
                for entry in entries {
                    let size = entry.size as usize;
                    out.extend(
                        data[offset..offset + size]
                            .iter()
                            .enumerate()
                            .map(|(i, &b)| (entry.address + i as u64, b)),
                    );
                    offset += size;
                }
            }
            _ => {}
        }
    }
    out
}

#[test]
fn five_entry_write_to_trace_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("five.aub");

    let entries = [
        PageInfo::new(0x1_0000, 0x1000, MemoryBank::SYSTEM),
        PageInfo::new(0x3_0000, 0x1000, MemoryBank::SYSTEM),
        PageInfo::new(0x2_0000, 0x1000, MemoryBank::SYSTEM),
        PageInfo::new(0x4_0002, 0x0FFE, MemoryBank::SYSTEM),
        PageInfo::new(0x8_0000_0000, 0x1000, MemoryBank::local(0)),
    ];
    let total = PageInfo::total_size(&entries);
    let source: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();

    let mut writer = AubWriter::create(&path, &gpu(), 1, FailurePolicy::Report).unwrap();
    writer
        .write_discontiguous(&entries, &source, DataHint::NONE)
        .unwrap();
    writer.close().unwrap();

    let file = BufReader::new(File::open(&path).unwrap());
    let records = AubReader::new(file).read_all().unwrap();
    assert_eq!(records.len(), 4);
    assert!(matches!(records[0], AubRecord::Version { .. }));

    match &records[1] {
        AubRecord::MemoryWriteDiscontiguous {
            space,
            entries: written,
            data,
            ..
        } => {
            assert_eq!(*space, AddressSpace::Nonlocal);
            let addresses: Vec<u64> = written.iter().map(|e| e.address).collect();
            assert_eq!(addresses, vec![0x1_0000, 0x3_0000, 0x2_0000]);
            assert_eq!(data.as_slice(), &source[..0x3000]);
        }
        other => panic!("expected a discontiguous write, got {other:?}"),
    }
    match &records[2] {
        AubRecord::MemoryWrite {
            address,
            space,
            data,
            ..
        } => {
            assert_eq!(*address, 0x4_0002);
            assert_eq!(*space, AddressSpace::Nonlocal);
            assert_eq!(data.as_slice(), &source[0x3000..0x3FFE]);
        }
        other => panic!("expected a contiguous write, got {other:?}"),
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
            assert_eq!(data.as_slice(), &source[0x3FFE..]);
        }
        other => panic!("expected a contiguous write, got {other:?}"),
    }
}

#[test]
fn every_record_kind_reads_back() {
    let mut gpu = gpu();
    gpu.abbreviation = Some(*b"dg2-g10\0");
    let mut writer = AubWriter::new(Vec::new(), &gpu, 4, FailurePolicy::Report).unwrap();

    let context = ContextDeclaration {
        handle: 1,
        engine: 2,
        ppgtt: true,
        levels: 4,
        page_table_root: 0x1_2345_6000,
        context_image: 0x7000,
        image_size: 0x2_2000,
    };
    let surface = SurfaceDump {
        base: 0x10_0000,
        width: 640,
        height: 480,
        pitch: 2560,
        format: 0xC7,
        tiling: 4,
        compressed: true,
        space: AddressSpace::PpgttGraphics,
        aux_base: 0x80_0000,
        aux_pitch: 128,
        qpitch: 480,
        clear_color_address: 0x9000,
        mode: 1,
    };

    writer.comment("frame 0").unwrap();
    writer.declare_context(&context).unwrap();
    writer
        .reserve_contiguous(0x20_0000, 0x40_0000, AddressSpace::Local)
        .unwrap();
    writer
        .write_contiguous(0x20_0000, b"abc", AddressSpace::Local, DataHint::BATCH_BUFFER)
        .unwrap();
    writer
        .expect_memory(0x20_0000, b"abc", AddressSpace::Local, CompareOp::NotEqual)
        .unwrap();
    writer.write_mmio(0x2030, 1).unwrap();
    writer.register_poll(0x2034, 0x1, 0x1, false, 0).unwrap();
    writer
        .dump_buffer(0x20_0000, 0x1000, AddressSpace::Local, "out.bin")
        .unwrap();
    writer.dump_surface(&surface).unwrap();
    writer.write_gtt(7, 0x5003).unwrap();
    assert_eq!(writer.records_written(), 11);

    let bytes = writer.into_inner().unwrap();
    let mut reader = AubReader::new(&bytes[..]);
    let mut raw = Vec::new();
    while let Some(record) = reader.next_raw().unwrap() {
        assert_eq!(record.payload.len(), 4 * record.dword_count() as usize);
        assert_eq!(split_header(record.header).0, 7);
        raw.push(record);
    }
    assert_eq!(reader.offset(), bytes.len() as u64);
    assert_eq!(raw.len(), 11);

    let records = records(&bytes);
    assert_eq!(
        records[0],
        AubRecord::Version {
            file_version: AUB_FILE_VERSION,
            tag: *b"DG2\0",
            stepping: 4,
            device_id: 0x56A0,
            recording_method: aubstream_aub::RECORDING_METHOD_LIBRARY,
            abbreviation: Some(*b"dg2-g10\0"),
        }
    );
    assert_eq!(
        records[1],
        AubRecord::Comment {
            text: "frame 0".into()
        }
    );
    assert_eq!(records[2], AubRecord::ContextDeclaration(context));
    assert_eq!(
        records[3],
        AubRecord::ContinuousRegion {
            address: 0x20_0000,
            space: AddressSpace::Local,
            size: 0x40_0000
        }
    );
    assert_eq!(
        records[4],
        AubRecord::MemoryWrite {
            address: 0x20_0000,
            space: AddressSpace::Local,
            hint: DataHint::BATCH_BUFFER,
            data: b"abc".to_vec()
        }
    );
    assert_eq!(
        records[5],
        AubRecord::MemoryCompare {
            address: 0x20_0000,
            space: AddressSpace::Local,
            op: CompareOp::NotEqual,
            data: b"abc".to_vec()
        }
    );
    assert_eq!(
        records[6],
        AubRecord::RegisterWrite {
            offset: 0x2030,
            mask: u32::MAX,
            value: 1
        }
    );
    assert_eq!(
        records[7],
        AubRecord::RegisterPoll {
            offset: 0x2034,
            mask: 1,
            value: 1,
            not_equal: false,
            timeout_action: 0
        }
    );
    assert_eq!(
        records[8],
        AubRecord::MemoryDump {
            address: 0x20_0000,
            space: AddressSpace::Local,
            size: 0x1000,
            file_name: "out.bin".into()
        }
    );
    assert_eq!(records[9], AubRecord::SurfaceDump(surface));
    assert_eq!(
        records[10],
        AubRecord::MemoryWrite {
            address: 56,
            space: AddressSpace::GttEntry,
            hint: DataHint::PAGE_TABLE,
            data: 0x5003u64.to_le_bytes().to_vec()
        }
    );
}

fn arb_entry() -> impl Strategy<Value = (usize, bool)> {
    (
        prop_oneof![Just(0x1000usize), 1usize..0x200, (1usize..0x100).prop_map(|d| d * 4)],
        any::<bool>(),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn discontiguous_writes_reconstruct_source(
        raw in prop::collection::vec(arb_entry(), 1..40),
        misalign in prop::collection::vec(0u64..4, 40),
    ) {
        // Give every entry its own 16 KiB slot so replayed bytes never overlap.
        let entries: Vec<PageInfo> = raw
            .iter()
            .enumerate()
            .map(|(i, &(size, local))| {
                let bank = if local { MemoryBank::local(0) } else { MemoryBank::SYSTEM };
                let base = if local { 0x8_0000_0000 } else { 0x10_0000 };
                let offset = if i % 3 == 0 { misalign[i] } else { 0 };
                PageInfo::new(base + i as u64 * 0x4000 + offset, size, bank)
            })
            .collect();
        let total = PageInfo::total_size(&entries);
        let source: Vec<u8> = (0..total).map(|i| (i * 7 % 256) as u8).collect();

        let mut writer = AubWriter::new(Vec::new(), &gpu(), 0, FailurePolicy::Report).unwrap();
        writer.write_discontiguous(&entries, &source, DataHint::NONE).unwrap();
        let bytes = writer.into_inner().unwrap();
        let replayed = replay(&records(&bytes));

        prop_assert_eq!(replayed.len(), total);
        let mut expected = Vec::with_capacity(total);
        let mut offset = 0usize;
        for entry in &entries {
            for i in 0..entry.size {
                expected.push((entry.phys_address + i as u64, source[offset + i]));
            }
            offset += entry.size;
        }
        prop_assert_eq!(replayed, expected);
    }
}
