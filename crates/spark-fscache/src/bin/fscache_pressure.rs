//! `fscache_pressure`：在真实系统遥测下驱动 `BufferPool` 的压力程序。
//!
//! # 用途（Why）
//! - 演示宿主侧的完整接线：安装 `tracing` Subscriber、装载 TOML 配置、注入基于 inode 表的驱逐回调；
//! - 若干写线程持续写入并周期性“上传”，让池在硬上限附近反复经历驱逐与阻塞唤醒。
//!
//! # 用法（How）
//! ```text
//! fscache_pressure [config.toml]
//! RUST_LOG=spark_fscache=debug fscache_pressure
//! ```
//! 配置未设置 `limit` 时使用 `DEMO_LIMIT`，保证写入总量超过上限。

use std::{collections::BTreeMap, process::ExitCode, sync::Arc, thread};

use parking_lot::Mutex;
use spark_fscache::{
    BufferPool, BufferPoolConfig, CleanBufferEvictor, ConfigError, FileChunk, OutOfMemory,
    OwnerId, PoolGuard,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const WRITERS: u64 = 4;
const ROUNDS: u64 = 64;
const CHUNK_LEN: usize = 64 * 1024;
/// 每写入这么多块做一次上传，在途脏块因此有上界。
const FLUSH_EVERY: u64 = 4;
const DEMO_LIMIT: u64 = 8 * 1024 * 1024;

/// 按 inode 保存缓存块的内存表。
///
/// 锁序固定为“池锁 → 表锁”：写线程总是先取得 [`PoolGuard`] 再锁表，
/// 驱逐回调被调用时池锁已由准入路径持有。
#[derive(Default)]
struct InodeTable {
    inodes: Mutex<BTreeMap<OwnerId, Vec<FileChunk>>>,
}

impl InodeTable {
    /// 把一批脏块标记为已上传并转为干净，之后它们可被驱逐。
    fn flush(&self, pool: &BufferPool, owner: OwnerId) {
        let mut guard = pool.lock();
        let mut inodes = self.inodes.lock();
        if let Some(chunks) = inodes.get_mut(&owner) {
            for chunk in chunks.iter_mut().filter(|chunk| chunk.is_dirty()) {
                chunk.mark_flushed();
                if let Err(err) = guard.mark_clean(chunk) {
                    warn!(owner, offset = chunk.offset(), error = %err, "chunk left dirty");
                }
            }
        }
    }

    fn drain(&self, pool: &BufferPool) -> u64 {
        let mut guard = pool.lock();
        let mut inodes = self.inodes.lock();
        let mut freed = 0;
        for chunks in inodes.values_mut() {
            let len = chunks.len();
            freed += guard.free_chunks(chunks, 0..len);
        }
        inodes.clear();
        freed
    }

    fn evict_clean(chunks: &mut Vec<FileChunk>, pool: &mut PoolGuard<'_>, want: u64) -> u64 {
        let mut freed = 0;
        let mut index = 0;
        while index < chunks.len() && freed < want {
            if chunks[index].is_dirty() {
                index += 1;
            } else {
                freed += pool.free_chunk(chunks, index);
            }
        }
        freed
    }
}

impl CleanBufferEvictor for InodeTable {
    /// 先回收其它 inode 的干净块；仍不足时回收请求方自己的干净块，
    /// 否则单个写线程积累的干净缓存会让自己永远等不到释放。
    fn free_some_clean_buffers(&self, pool: &mut PoolGuard<'_>, owner: OwnerId, size: u64) -> u64 {
        let mut inodes = self.inodes.lock();
        let mut freed = 0;
        for (_, chunks) in inodes.iter_mut().filter(|(id, _)| **id != owner) {
            if freed >= size {
                break;
            }
            freed += Self::evict_clean(chunks, pool, size - freed);
        }
        if freed < size
            && let Some(own) = inodes.get_mut(&owner)
        {
            freed += Self::evict_clean(own, pool, size - freed);
        }
        freed
    }
}

fn load_config() -> Result<BufferPoolConfig, ConfigError> {
    let Some(path) = std::env::args().nth(1) else {
        return Ok(BufferPoolConfig::default().with_limit(DEMO_LIMIT));
    };
    let config = BufferPoolConfig::from_toml_file(path)?;
    if config.limit == 0 {
        return Ok(config.with_limit(DEMO_LIMIT));
    }
    Ok(config)
}

fn write_inode(pool: &BufferPool, table: &InodeTable, owner: OwnerId) -> Result<(), OutOfMemory> {
    for round in 0..ROUNDS {
        let offset = round * CHUNK_LEN as u64;
        let mut chunk = pool.alloc_chunk(owner, offset, CHUNK_LEN, true)?;
        chunk.data_mut().fill(owner as u8);
        {
            let _guard = pool.lock();
            table.inodes.lock().entry(owner).or_default().push(chunk);
        }
        if (round + 1) % FLUSH_EVERY == 0 {
            table.flush(pool, owner);
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "failed to load buffer pool config");
            return ExitCode::FAILURE;
        }
    };
    info!(
        limit = config.limit,
        recompute_interval = config.recompute_interval,
        cgroup_root = %config.cgroup_root.display(),
        "starting buffer pool pressure run"
    );

    let table = Arc::new(InodeTable::default());
    let pool = match BufferPool::new(config, Arc::clone(&table)) {
        Ok(pool) => pool,
        Err(err) => {
            error!(error = %err, "invalid buffer pool config");
            return ExitCode::FAILURE;
        }
    };

    let writers: Vec<_> = (1..=WRITERS)
        .map(|owner| {
            let pool = Arc::clone(&pool);
            let table = Arc::clone(&table);
            thread::spawn(move || write_inode(&pool, &table, owner))
        })
        .collect();

    let mut failed = false;
    for writer in writers {
        match writer.join() {
            Ok(Ok(())) => {}
            Ok(Err(exhausted)) => {
                error!(error = %exhausted, "writer hit fatal buffer exhaustion");
                failed = true;
            }
            Err(_) => {
                error!("writer thread panicked");
                failed = true;
            }
        }
    }

    let stats = pool.stats();
    info!(
        committed = stats.committed_bytes,
        dirty = stats.dirty_bytes,
        ceiling = stats.ceiling,
        "writers finished"
    );
    let freed = table.drain(&pool);
    let stats = pool.stats();
    if stats.committed_bytes != 0 {
        warn!(committed = stats.committed_bytes, "bytes still committed after drain");
    }
    info!(freed, "drained inode table");

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
