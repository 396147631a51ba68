use octets::{ByteReader, ByteWriter};
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum Op {
    U8(u8),
    U16(u16),
    U32(u32),
    Bytes(Vec<u8>),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        any::<u8>().prop_map(Op::U8),
        any::<u16>().prop_map(Op::U16),
        any::<u32>().prop_map(Op::U32),
        prop::collection::vec(any::<u8>(), 0..32).prop_map(Op::Bytes),
    ]
}

fn op_len(op: &Op) -> usize {
    match op {
        Op::U8(_) => 1,
        Op::U16(_) => 2,
        Op::U32(_) => 4,
        Op::Bytes(bytes) => bytes.len(),
    }
}

proptest! {
    #[test]
    fn prop_roundtrip_ops(ops in prop::collection::vec(op_strategy(), 1..64)) {
        let total: usize = ops.iter().map(op_len).sum();
        let mut buf = vec![0u8; total];
        let mut writer = ByteWriter::new(&mut buf);

        for op in &ops {
            match op {
                Op::U8(v) => writer.write_u8(*v).unwrap(),
                Op::U16(v) => writer.write_u16(*v).unwrap(),
                Op::U32(v) => writer.write_u32(*v).unwrap(),
                Op::Bytes(bytes) => writer.write_bytes(bytes).unwrap(),
            }
        }
        prop_assert_eq!(writer.finish(), total);

        let mut reader = ByteReader::new(&buf);
        for op in &ops {
            match op {
                Op::U8(v) => {
                    prop_assert_eq!(reader.read_u8().unwrap(), *v);
                }
                Op::U16(v) => {
                    prop_assert_eq!(reader.read_u16().unwrap(), *v);
                }
                Op::U32(v) => {
                    prop_assert_eq!(reader.read_u32().unwrap(), *v);
                }
                Op::Bytes(bytes) => {
                    prop_assert_eq!(reader.read_bytes(bytes.len()).unwrap(), bytes.as_slice());
                }
            }
        }
        prop_assert!(reader.is_empty());
    }

    #[test]
    fn prop_short_buffer_never_panics(data in prop::collection::vec(any::<u8>(), 0..8)) {
        let mut reader = ByteReader::new(&data);
        while reader.read_u32().is_ok() {}
        prop_assert!(reader.remaining() < 4);
    }
}
