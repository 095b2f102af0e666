use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, warn};

use crate::{
    chunk::FileChunk,
    config::BufferPoolConfig,
    error::{ConfigError, OutOfMemory},
    telemetry::{MemoryProbe, SystemMemoryProbe, compute_ceiling},
};

/// 持有缓存数据的实体标识（通常为 inode 号）。
pub type OwnerId = u64;

/// `CleanBufferEvictor` 是缓存管理层注入的驱逐回调。
///
/// # 教案式说明
/// - **意图 (Why)**：池只负责计数、阻塞与唤醒；“驱逐哪些干净块”属于 inode 表的策略，
///   通过该 trait 在准入超限时反向调用。
/// - **契约 (What)**：
///   - `owner`：发起准入请求的实体，回调应优先回收*其它*实体的干净字节；
///   - `size`：当前缺口字节数；返回值为实际回收的字节数；
///   - 回收必须经由传入的 `pool`（已持锁的 [`PoolGuard`]）执行 `free_chunk`/`free`，保证计数自洽；
///   - `PoolGuard` 不提供准入入口，回调在结构上无法重入 `reserve`。
/// - **风险 (Trade-offs)**：回调执行期间持有池锁；若回调内部还要获取 inode 表等锁，
///   全局锁序必须是“池锁 → 调用方自己的锁”，否则会与持表锁后再释放缓冲的路径死锁。
pub trait CleanBufferEvictor: Send + Sync + 'static {
    fn free_some_clean_buffers(&self, pool: &mut PoolGuard<'_>, owner: OwnerId, size: u64) -> u64;
}

impl<T: CleanBufferEvictor + ?Sized> CleanBufferEvictor for Arc<T> {
    fn free_some_clean_buffers(&self, pool: &mut PoolGuard<'_>, owner: OwnerId, size: u64) -> u64 {
        (**self).free_some_clean_buffers(pool, owner, size)
    }
}

/// 不回收任何字节的驱逐器，适用于没有干净缓存可丢弃的宿主。
#[derive(Clone, Copy, Debug, Default)]
pub struct NoEviction;

impl CleanBufferEvictor for NoEviction {
    fn free_some_clean_buffers(&self, _: &mut PoolGuard<'_>, _: OwnerId, _: u64) -> u64 {
        0
    }
}

/// 池状态快照，供读路径与诊断输出使用。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub committed_bytes: u64,
    pub dirty_bytes: u64,
    pub ceiling: u64,
    pub limit: u64,
    pub waiters: usize,
    pub next_dirty_id: u64,
}

#[derive(Debug)]
pub(crate) struct PoolState {
    committed: u64,
    committed_dirty: u64,
    ceiling: u64,
    requests: u64,
    next_dirty_id: u64,
    waiters: usize,
}

/// `BufferPool` 是文件缓存层唯一的内存准入控制器。
///
/// # 模块角色（Why）
/// - 所有文件句柄在分配缓冲前都必须向同一个池申请额度，池据此把缓存总量约束在动态 ceiling 之内；
/// - ceiling 由周期性遥测采样得到，池随系统内存压力伸缩而不是预留固定内存板；
/// - 池是显式构造的实例，以 `Arc` 在组件间传递，从不作为全局单例存在。
///
/// # 核心机制（How）
/// - 一把 `parking_lot::Mutex` 保护全部计数，一个绑定在同一把锁上的 `Condvar` 负责阻塞与广播唤醒；
/// - 超限时先调用驱逐回调回收其它实体的干净字节；仍不足且池内尚有在途缓冲时阻塞等待释放；
///   池内完全为空仍不足时重新采样，再失败即判定为致命 [`OutOfMemory`]；
/// - 共享缓冲的引用计数只在持锁时经 [`PoolGuard`] 修改，与记账更新原子一致。
///
/// # 契约说明（What）
/// - **线程安全**：`Send + Sync`，可被任意线程并发调用；只有 [`BufferPool::reserve`] 可能挂起；
/// - **公平性**：不保证 FIFO。唤醒为广播，所有等待者重新竞争锁并各自复查条件，
///   大请求可能被源源不断的小请求饿死；负载由驱逐驱动、对延迟不敏感，这是已知且接受的活性缺口；
/// - **取消**：无超时、无取消；需要取消语义的宿主应在此处扩展，而不是假设已存在。
pub struct BufferPool {
    state: Mutex<PoolState>,
    cond: Condvar,
    config: BufferPoolConfig,
    probe: Box<dyn MemoryProbe>,
    evictor: Box<dyn CleanBufferEvictor>,
}

impl BufferPool {
    /// 使用系统探针创建池，cgroup 根目录取自配置。
    pub fn new(
        config: BufferPoolConfig,
        evictor: impl CleanBufferEvictor,
    ) -> Result<Arc<Self>, ConfigError> {
        let probe = SystemMemoryProbe::new(&config.cgroup_root);
        Self::with_probe(config, probe, evictor)
    }

    /// 使用自定义探针创建池，并立即完成首次 ceiling 采样。
    ///
    /// 配置先经 [`BufferPoolConfig::validate`] 校验，以代码构造的配置与 TOML 装载的配置遵守同一约束。
    pub fn with_probe(
        config: BufferPoolConfig,
        probe: impl MemoryProbe,
        evictor: impl CleanBufferEvictor,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        // 采样失败时的初始回退值：有硬上限取硬上限，否则不设限。
        let fallback = if config.limit > 0 {
            config.limit
        } else {
            u64::MAX
        };
        let ceiling = compute_ceiling(&probe, 0, config.limit, fallback);
        Ok(Arc::new(Self {
            state: Mutex::new(PoolState {
                committed: 0,
                committed_dirty: 0,
                ceiling,
                requests: 0,
                next_dirty_id: 1,
                waiters: 0,
            }),
            cond: Condvar::new(),
            config,
            probe: Box::new(probe),
            evictor: Box::new(evictor),
        }))
    }

    pub fn config(&self) -> &BufferPoolConfig {
        &self.config
    }

    /// 获取池锁，用于在一个临界区内串联多次释放、拆分等操作。
    pub fn lock(&self) -> PoolGuard<'_> {
        PoolGuard {
            pool: self,
            state: self.state.lock(),
        }
    }

    /// 为 `owner` 申请 `size` 字节额度，必要时驱逐或阻塞。
    ///
    /// # 教案式说明
    /// - **逻辑 (How)**：
    ///   1. 请求计数累加，每满 `recompute_interval` 次归还空闲内存并重新采样 ceiling；
    ///   2. `committed + size > ceiling` 时调用驱逐回调，缺口为超出部分；
    ///   3. 仍超限：池内无在途缓冲则再采样一次，仍超限返回 [`OutOfMemory`]，否则直接放行；
    ///      池内有在途缓冲则阻塞到下一次广播唤醒后复查；
    ///   4. 提交：`committed += size`，脏请求同时计入脏字节。
    /// - **契约 (What)**：返回 `Ok(())` 时额度已提交，调用方随后分配缓冲；
    ///   返回 `Err` 时调用方必须终止进程（见 [`OutOfMemory::abort`]）。
    pub fn reserve(&self, owner: OwnerId, size: u64, dirty: bool) -> Result<(), OutOfMemory> {
        debug!(owner, size, dirty, "requesting buffer admission");
        let mut guard = self.lock();

        guard.state.requests += 1;
        if guard.state.requests >= self.config.recompute_interval {
            guard.recompute_ceiling();
            guard.state.requests = 0;
        }

        while guard.exceeds_ceiling(size) {
            let shortfall = guard.state.committed.saturating_add(size) - guard.state.ceiling;
            let freed = self
                .evictor
                .free_some_clean_buffers(&mut guard, owner, shortfall);
            debug!(
                owner,
                freed,
                committed = guard.state.committed,
                size,
                ceiling = guard.state.ceiling,
                "eviction round finished"
            );
            if !guard.exceeds_ceiling(size) {
                break;
            }
            if guard.state.committed == 0 {
                guard.recompute_ceiling();
                if guard.exceeds_ceiling(size) {
                    let exhausted = OutOfMemory {
                        requested: size,
                        committed: guard.state.committed,
                        ceiling: guard.state.ceiling,
                    };
                    error!(
                        requested = size,
                        committed = exhausted.committed,
                        ceiling = exhausted.ceiling,
                        "unable to admit buffer with nothing left to evict or flush"
                    );
                    return Err(exhausted);
                }
                break;
            }
            guard.state.waiters += 1;
            self.cond.wait(&mut guard.state);
            guard.state.waiters -= 1;
        }

        guard.state.committed = guard.state.committed.saturating_add(size);
        if dirty {
            guard.state.committed_dirty = guard.state.committed_dirty.saturating_add(size);
        }
        Ok(())
    }

    /// [`BufferPool::reserve`] 的便捷形式：致命耗尽时直接中止进程。
    pub fn reserve_or_abort(&self, owner: OwnerId, size: u64, dirty: bool) {
        if let Err(exhausted) = self.reserve(owner, size, dirty) {
            exhausted.abort();
        }
    }

    /// 归还 `size` 字节额度。
    pub fn free(&self, size: u64, dirty: bool) {
        self.lock().free(size, dirty);
    }

    /// 调整脏字节计数，不触碰已提交总量，也不会阻塞或触发驱逐。
    pub fn add_dirty(&self, delta: i64) {
        self.lock().add_dirty(delta);
    }

    /// 分配下一个脏块编号，0 保留为“未修改”。
    pub fn next_dirty_id(&self) -> u64 {
        self.lock().next_dirty_id()
    }

    /// 申请额度并分配一块清零的缓冲，包装为引用计数为 1 的块描述符。
    pub fn alloc_chunk(
        &self,
        owner: OwnerId,
        offset: u64,
        len: usize,
        dirty: bool,
    ) -> Result<FileChunk, OutOfMemory> {
        self.reserve(owner, len as u64, dirty)?;
        let dirty_id = if dirty { self.next_dirty_id() } else { 0 };
        Ok(FileChunk::zeroed(offset, len, dirty_id))
    }

    /// 申请额度并把 `data` 复制进新分配的缓冲。
    pub fn alloc_chunk_from(
        &self,
        owner: OwnerId,
        offset: u64,
        data: &[u8],
        dirty: bool,
    ) -> Result<FileChunk, OutOfMemory> {
        self.reserve(owner, data.len() as u64, dirty)?;
        let dirty_id = if dirty { self.next_dirty_id() } else { 0 };
        Ok(FileChunk::copied(offset, data, dirty_id))
    }

    /// 从集合中释放第 `index` 个块描述符，返回实际归还给池的字节数。
    pub fn free_chunk(&self, chunks: &mut Vec<FileChunk>, index: usize) -> u64 {
        self.lock().free_chunk(chunks, index)
    }

    /// 释放集合中 `range` 范围内的全部块描述符。
    pub fn free_chunks(&self, chunks: &mut Vec<FileChunk>, range: std::ops::Range<usize>) -> u64 {
        self.lock().free_chunks(chunks, range)
    }

    /// 在 `at` 处零拷贝拆分块描述符，返回后半段。
    pub fn split_chunk(&self, chunk: &mut FileChunk, at: usize) -> FileChunk {
        self.lock().split_chunk(chunk, at)
    }

    pub fn committed_bytes(&self) -> u64 {
        self.state.lock().committed
    }

    pub fn dirty_bytes(&self) -> u64 {
        self.state.lock().committed_dirty
    }

    pub fn stats(&self) -> PoolStats {
        self.lock().stats()
    }
}

/// 持有池锁期间的操作句柄，对应各操作的“已持锁”形式。
///
/// # 契约说明（What）
/// - 只暴露不会阻塞的操作：释放、脏字节调整、编号分配、块拆分与释放；
/// - 准入 [`BufferPool::reserve`] 不在其中，驱逐回调因此无法重入；
/// - 共享缓冲的引用计数只能经由本句柄修改，Drop 时自动解锁。
pub struct PoolGuard<'a> {
    pool: &'a BufferPool,
    pub(crate) state: MutexGuard<'a, PoolState>,
}

impl PoolGuard<'_> {
    /// 已持锁形式的 [`BufferPool::free`]。
    ///
    /// 若有准入请求在等待且本次确实归还了字节，则广播唤醒全部等待者，由它们各自复查条件。
    pub fn free(&mut self, size: u64, dirty: bool) {
        match self.state.committed.checked_sub(size) {
            Some(committed) => self.state.committed = committed,
            None => {
                error!(
                    size,
                    committed = self.state.committed,
                    "buffer pool accounting underflow"
                );
                self.state.committed = 0;
            }
        }
        if dirty {
            match self.state.committed_dirty.checked_sub(size) {
                Some(dirty) => self.state.committed_dirty = dirty,
                None => {
                    error!(
                        size,
                        dirty = self.state.committed_dirty,
                        "buffer pool dirty accounting underflow"
                    );
                    self.state.committed_dirty = 0;
                }
            }
        }
        if self.state.committed_dirty > self.state.committed {
            error!(
                dirty = self.state.committed_dirty,
                committed = self.state.committed,
                "dirty bytes exceed committed bytes after release, clamping"
            );
            self.state.committed_dirty = self.state.committed;
        }
        if size > 0 && self.state.waiters > 0 {
            self.pool.cond.notify_all();
        }
    }

    /// 已持锁形式的 [`BufferPool::add_dirty`]。
    pub fn add_dirty(&mut self, delta: i64) {
        let adjusted = match self.state.committed_dirty.checked_add_signed(delta) {
            Some(value) => value,
            None => {
                warn!(
                    delta,
                    dirty = self.state.committed_dirty,
                    "dirty accounting adjustment out of range, clamping"
                );
                if delta < 0 { 0 } else { u64::MAX }
            }
        };
        if adjusted > self.state.committed {
            warn!(
                adjusted,
                committed = self.state.committed,
                "dirty bytes exceed committed bytes, clamping"
            );
        }
        self.state.committed_dirty = adjusted.min(self.state.committed);
    }

    pub fn next_dirty_id(&mut self) -> u64 {
        let id = self.state.next_dirty_id;
        self.state.next_dirty_id += 1;
        id
    }

    pub fn committed_bytes(&self) -> u64 {
        self.state.committed
    }

    pub fn dirty_bytes(&self) -> u64 {
        self.state.committed_dirty
    }

    pub fn ceiling(&self) -> u64 {
        self.state.ceiling
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            committed_bytes: self.state.committed,
            dirty_bytes: self.state.committed_dirty,
            ceiling: self.state.ceiling,
            limit: self.pool.config.limit,
            waiters: self.state.waiters,
            next_dirty_id: self.state.next_dirty_id,
        }
    }

    fn exceeds_ceiling(&self, size: u64) -> bool {
        self.state.committed.saturating_add(size) > self.state.ceiling
    }

    /// 归还分配器空闲内存并按当前已提交量重新计算 ceiling；ceiling 上调且有等待者时广播唤醒。
    fn recompute_ceiling(&mut self) {
        let pool = self.pool;
        pool.probe.release_free_memory();
        let previous = self.state.ceiling;
        self.state.ceiling = compute_ceiling(
            pool.probe.as_ref(),
            self.state.committed,
            pool.config.limit,
            previous,
        );
        if self.state.ceiling > previous && self.state.waiters > 0 {
            pool.cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::StaticMemoryProbe;
    use tracing_test::traced_test;

    fn pool_with(limit: u64, available: u64) -> (Arc<BufferPool>, Arc<StaticMemoryProbe>) {
        let probe = Arc::new(StaticMemoryProbe::new(available));
        let pool = BufferPool::with_probe(
            BufferPoolConfig::default().with_limit(limit),
            Arc::clone(&probe),
            NoEviction,
        )
        .expect("有效配置");
        (pool, probe)
    }

    #[test]
    fn dirty_ids_start_at_one_and_increase() {
        let (pool, _) = pool_with(100, 1 << 20);
        assert_eq!(pool.next_dirty_id(), 1);
        assert_eq!(pool.next_dirty_id(), 2);
        let mut guard = pool.lock();
        assert_eq!(guard.next_dirty_id(), 3);
    }

    #[test]
    fn ceiling_is_resampled_every_interval() {
        let (pool, probe) = pool_with(0, 1000);
        let initial_releases = probe.releases();
        for _ in 0..15 {
            pool.reserve(1, 1, false).expect("额度充足");
        }
        assert_eq!(probe.releases(), initial_releases, "前 15 次请求不触发采样");
        probe.set_system_available(Some(5000));
        pool.reserve(1, 1, false).expect("第 16 次请求");
        assert_eq!(probe.releases(), initial_releases + 1);
        // 采样发生在提交之前：此时已提交 15 字节。
        assert_eq!(pool.stats().ceiling, 5015);
    }

    #[test]
    fn add_dirty_clamps_to_committed_range() {
        let (pool, _) = pool_with(100, 1 << 20);
        pool.reserve(1, 40, true).expect("额度充足");
        pool.add_dirty(-10);
        assert_eq!(pool.dirty_bytes(), 30);
        pool.add_dirty(-100);
        assert_eq!(pool.dirty_bytes(), 0);
        pool.add_dirty(500);
        assert_eq!(pool.dirty_bytes(), 40, "脏字节不得超过已提交字节");
        assert_eq!(pool.committed_bytes(), 40);
    }

    #[test]
    fn free_underflow_is_clamped() {
        let (pool, _) = pool_with(100, 1 << 20);
        pool.reserve(1, 10, false).expect("额度充足");
        pool.free(25, true);
        assert_eq!(pool.committed_bytes(), 0);
        assert_eq!(pool.dirty_bytes(), 0);
    }

    #[traced_test]
    #[test]
    fn free_keeps_dirty_within_committed() {
        let (pool, _) = pool_with(100, 1 << 20);
        pool.reserve(1, 30, false).expect("额度充足");
        pool.reserve(2, 10, true).expect("额度充足");
        pool.add_dirty(30);
        assert_eq!(pool.dirty_bytes(), 40);

        pool.free(30, false);
        assert_eq!(pool.committed_bytes(), 10);
        assert_eq!(pool.dirty_bytes(), 10, "按干净字节归还后脏字节被裁剪到已提交量");
        assert!(logs_contain("dirty bytes exceed committed bytes after release"));
    }

    #[test]
    fn constructor_rejects_zero_recompute_interval() {
        let outcome = BufferPool::with_probe(
            BufferPoolConfig::default().with_recompute_interval(0),
            StaticMemoryProbe::new(1 << 20),
            NoEviction,
        );
        assert!(matches!(outcome, Err(ConfigError::ZeroRecomputeInterval)));
    }

    #[test]
    fn zero_committed_resample_can_rescue_request() {
        let (pool, probe) = pool_with(0, 10);
        probe.set_system_available(Some(1000));
        pool.reserve(7, 500, false).expect("空池重新采样后应放行");
        assert_eq!(pool.committed_bytes(), 500);
    }
}
