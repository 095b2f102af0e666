//! 记账性质测试：任意分配、拆分、释放序列之后，池的计数必须与存活的共享租约一致。
//!
//! # 教案级注释概览
//!
//! - **核心目标 (Why)**：`committed` 等于所有存活 `SharedBuffer` 长度之和（按租约去重），
//!   `dirty` 等于其中脏租约长度之和，且始终不超过 `committed`；
//! - **设计手法 (How)**：proptest 生成分配、拆分、释放、脏净切换的操作序列，在真实 `BufferPool` 上执行，
//!   每步之后从存活描述符重新推导期望值；
//! - **边界 (What)**：额度远大于序列可能申请的总量，性质只关心记账，不涉及阻塞路径。

use std::{collections::BTreeMap, sync::Arc};

use proptest::prelude::*;
use spark_fscache::{
    BufferPool, BufferPoolConfig, FileChunk, NoEviction, SharedBuffer, StaticMemoryProbe,
};

#[derive(Debug, Clone)]
enum Op {
    Alloc { len: usize, dirty: bool },
    Split { index: usize, at_permille: usize },
    Free { index: usize },
    Mark { index: usize, dirty: bool },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1usize..64, any::<bool>()).prop_map(|(len, dirty)| Op::Alloc { len, dirty }),
        (any::<usize>(), 0usize..=1000)
            .prop_map(|(index, at_permille)| Op::Split { index, at_permille }),
        any::<usize>().prop_map(|index| Op::Free { index }),
        (any::<usize>(), any::<bool>()).prop_map(|(index, dirty)| Op::Mark { index, dirty }),
    ]
}

/// 把千分比映射到合法拆分点 `0 < at < len`，长度不足 2 时无法拆分。
fn split_point(len: usize, permille: usize) -> Option<usize> {
    (len >= 2).then(|| 1 + (len - 2) * permille / 1000)
}

/// 从存活描述符推导 (committed, dirty)，同一租约只计一次。
fn expected(chunks: &[FileChunk]) -> (u64, u64) {
    let mut leases: BTreeMap<*const SharedBuffer, (u64, bool)> = BTreeMap::new();
    for chunk in chunks {
        let buffer = chunk.shared_buffer();
        leases.insert(Arc::as_ptr(buffer), (buffer.len(), chunk.is_dirty()));
    }
    leases.values().fold((0, 0), |(committed, dirty), (len, is_dirty)| {
        (committed + len, dirty + if *is_dirty { *len } else { 0 })
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn accounting_matches_live_leases(ops in prop::collection::vec(op(), 1..48)) {
        let pool = BufferPool::with_probe(
            BufferPoolConfig::default().with_limit(1 << 40),
            StaticMemoryProbe::new(1 << 41),
            NoEviction,
        )
        .expect("有效配置");
        let mut chunks: Vec<FileChunk> = Vec::new();
        let mut offset = 0u64;

        for op in ops {
            match op {
                Op::Alloc { len, dirty } => {
                    let chunk = pool.alloc_chunk(1, offset, len, dirty).expect("额度充足");
                    offset += len as u64;
                    chunks.push(chunk);
                }
                Op::Split { index, at_permille } if !chunks.is_empty() => {
                    let index = index % chunks.len();
                    if let Some(at) = split_point(chunks[index].len(), at_permille) {
                        let tail = pool.split_chunk(&mut chunks[index], at);
                        chunks.insert(index + 1, tail);
                    }
                }
                Op::Mark { index, dirty } if !chunks.is_empty() => {
                    let index = index % chunks.len();
                    let exclusive = chunks[index].shared_buffer().refs() == 1;
                    let mut guard = pool.lock();
                    let outcome = if dirty {
                        guard.mark_dirty(&mut chunks[index]).map(|_| ())
                    } else {
                        guard.mark_clean(&mut chunks[index])
                    };
                    prop_assert_eq!(outcome.is_ok(), exclusive);
                }
                Op::Free { index } if !chunks.is_empty() => {
                    let index = index % chunks.len();
                    pool.free_chunk(&mut chunks, index);
                }
                _ => {}
            }

            let (committed, dirty) = expected(&chunks);
            prop_assert_eq!(pool.committed_bytes(), committed);
            prop_assert_eq!(pool.dirty_bytes(), dirty);
            prop_assert!(pool.dirty_bytes() <= pool.committed_bytes());
        }

        let len = chunks.len();
        pool.free_chunks(&mut chunks, 0..len);
        prop_assert_eq!(pool.committed_bytes(), 0);
        prop_assert_eq!(pool.dirty_bytes(), 0);
    }

    /// 同一租约的全部描述符脏净分类一致。
    #[test]
    fn split_keeps_lease_classification_uniform(
        len in 1usize..256,
        dirty in any::<bool>(),
        cuts in prop::collection::vec(0usize..=1000, 0..8),
    ) {
        let pool = BufferPool::with_probe(
            BufferPoolConfig::default().with_limit(1 << 20),
            StaticMemoryProbe::new(1 << 30),
            NoEviction,
        )
        .expect("有效配置");
        let mut chunks = vec![pool.alloc_chunk(3, 0, len, dirty).expect("额度充足")];
        for cut in cuts {
            let last = chunks.len() - 1;
            if let Some(at) = split_point(chunks[last].len(), cut) {
                let tail = pool.split_chunk(&mut chunks[last], at);
                chunks.push(tail);
            }
        }

        prop_assert!(chunks.iter().all(|chunk| chunk.is_dirty() == dirty));
        prop_assert_eq!(chunks.iter().map(FileChunk::len).sum::<usize>(), len);
        prop_assert_eq!(chunks[0].shared_buffer().refs(), chunks.len());
        let mut expected_offset = 0u64;
        for chunk in &chunks {
            prop_assert_eq!(chunk.offset(), expected_offset);
            expected_offset = chunk.end();
        }

        let count = chunks.len();
        prop_assert_eq!(pool.free_chunks(&mut chunks, 0..count), len as u64);
        prop_assert_eq!(pool.committed_bytes(), 0);
    }
}
