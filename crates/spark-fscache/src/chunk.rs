use std::{
    fmt,
    ops::Range,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytes::BytesMut;
use tracing::error;

use crate::{error::SharedLease, pool::PoolGuard};

/// `SharedBuffer` 是一块连续分配在池记账中的“租约”。
///
/// # 角色定位（Why）
/// - 同一块内存可能被拆分为多个块描述符（例如部分覆盖写把一个块切成三段），
///   只有最后一个描述符被释放时才能把整块长度归还给池；
/// - 内存本身由各描述符持有的 `BytesMut` 视图共享，`bytes` 负责在最后一个视图销毁时回收物理内存；
///   本结构只负责池侧的计数，二者各司其职。
///
/// # 结构设计（How）
/// - `len`：分配时的完整长度，即准入时提交的字节数；
/// - `refs`：引用本租约的描述符数量。读取无锁，修改只发生在 [`PoolGuard`] 的方法内，
///   保证引用计数与池记账在同一把锁下原子变化。
///
/// # 风险（Trade-offs）
/// - 描述符被直接丢弃而未经 `free_chunk` 释放时，字节会永久计入池中；
///   `Drop` 只能记录错误日志，无法补账（此时拿不到锁）。
pub struct SharedBuffer {
    len: u64,
    refs: AtomicUsize,
}

impl SharedBuffer {
    fn new(len: u64) -> Arc<Self> {
        Arc::new(Self {
            len,
            refs: AtomicUsize::new(1),
        })
    }

    /// 分配时的完整字节数。
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 当前引用本租约的块描述符数量。
    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Relaxed)
    }

    fn retain(&self, _locked: &PoolGuard<'_>) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    /// 引用计数减一，归零时返回 `true`。
    fn release(&self, _locked: &PoolGuard<'_>) -> bool {
        let previous = self.refs.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "SharedBuffer 引用计数下溢");
        previous == 1
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        let refs = *self.refs.get_mut();
        if refs > 0 && !std::thread::panicking() {
            error!(
                len = self.len,
                refs, "shared buffer dropped without being released, its bytes stay committed"
            );
        }
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("len", &self.len)
            .field("refs", &self.refs())
            .finish()
    }
}

/// `FileChunk` 是缓存层操作的基本单位：文件中一段逻辑字节区间及其修改状态。
///
/// # 契约说明（What）
/// - `offset`：该段在所属文件中的逻辑偏移；
/// - `dirty_id`：0 表示内容与远端对象一致；非 0 为写入或拆分时分配的唯一编号，
///   刷写器据此跟踪在途上传，使刷写与并发写入互不干扰；
/// - `flushed`：本代内容已作为分段上传的一部分交给远端；在整个上传提交前，块在逻辑上仍是脏的；
/// - 数据为共享分配上的一段不重叠 `BytesMut` 视图，拆分不复制。
///
/// 描述符不可克隆：每个描述符恰好占用共享租约的一个引用，必须经由
/// [`PoolGuard::free_chunk`] 或 [`PoolGuard::release_chunk`] 释放。
pub struct FileChunk {
    offset: u64,
    dirty_id: u64,
    flushed: bool,
    data: BytesMut,
    buffer: Arc<SharedBuffer>,
}

impl FileChunk {
    pub(crate) fn zeroed(offset: u64, len: usize, dirty_id: u64) -> Self {
        Self::from_bytes(offset, BytesMut::zeroed(len), dirty_id)
    }

    pub(crate) fn copied(offset: u64, data: &[u8], dirty_id: u64) -> Self {
        Self::from_bytes(offset, BytesMut::from(data), dirty_id)
    }

    fn from_bytes(offset: u64, data: BytesMut, dirty_id: u64) -> Self {
        let buffer = SharedBuffer::new(data.len() as u64);
        Self {
            offset,
            dirty_id,
            flushed: false,
            data,
            buffer,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// 块末尾之后的第一个文件偏移。
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn dirty_id(&self) -> u64 {
        self.dirty_id
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty_id != 0
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    /// 标记本代内容已作为分段上传交给远端。
    pub fn mark_flushed(&mut self) {
        self.flushed = true;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn shared_buffer(&self) -> &Arc<SharedBuffer> {
        &self.buffer
    }

    /// 两个描述符是否指向同一块共享分配。
    pub fn shares_buffer_with(&self, other: &FileChunk) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }
}

impl AsRef<[u8]> for FileChunk {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for FileChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileChunk")
            .field("offset", &self.offset)
            .field("len", &self.data.len())
            .field("dirty_id", &self.dirty_id)
            .field("flushed", &self.flushed)
            .field("buffer", &self.buffer)
            .finish()
    }
}

impl PoolGuard<'_> {
    /// 从集合中移除第 `index` 个描述符并释放其引用，保持其余描述符的相对顺序。
    ///
    /// # 教案式说明
    /// - **逻辑 (How)**：共享租约引用计数减一；归零时以整块长度调用 [`PoolGuard::free`]，
    ///   是否按脏字节归还取决于*被释放的这个*描述符的 `dirty_id`；
    /// - **契约 (What)**：返回实际归还给池的字节数，租约仍被其它描述符引用时为 0；
    ///   `index` 越界时 panic（与 `Vec::remove` 一致）；
    /// - **前提 (Trade-offs)**：按最后释放者分类之所以成立，是因为同一租约的描述符脏净一致：
    ///   拆分沿用原分类，[`PoolGuard::mark_dirty`]/[`PoolGuard::mark_clean`] 拒绝共享租约。
    pub fn free_chunk(&mut self, chunks: &mut Vec<FileChunk>, index: usize) -> u64 {
        let chunk = chunks.remove(index);
        self.release_chunk(chunk)
    }

    /// 释放 `range` 内的全部描述符（截断、拼接路径），返回归还的总字节数。
    pub fn free_chunks(&mut self, chunks: &mut Vec<FileChunk>, range: Range<usize>) -> u64 {
        let mut freed = 0;
        for chunk in chunks.drain(range) {
            freed += self.release_chunk(chunk);
        }
        freed
    }

    /// 释放一个已脱离集合的描述符。
    pub fn release_chunk(&mut self, chunk: FileChunk) -> u64 {
        if !chunk.buffer.release(self) {
            return 0;
        }
        let len = chunk.buffer.len();
        self.free(len, chunk.is_dirty());
        len
    }

    /// 在 `at` 处拆分描述符：`chunk` 保留 `[0, at)`，返回 `[at, len)`。
    ///
    /// 两段共享同一块分配，引用计数加一，不申请新额度。脏块的两段都获得新的 `dirty_id`
    /// 并清除 `flushed`；干净块两段保持干净，同一租约的脏净分类因此始终一致。
    ///
    /// # Panics
    /// 除非 `0 < at < chunk.len()`，否则 panic：空描述符也会占用一个租约引用。
    pub fn split_chunk(&mut self, chunk: &mut FileChunk, at: usize) -> FileChunk {
        assert!(
            at > 0 && at < chunk.len(),
            "split_chunk 越界：at = {at}，len = {}",
            chunk.len()
        );
        let tail = chunk.data.split_off(at);
        chunk.buffer.retain(self);
        let tail_dirty_id = if chunk.is_dirty() {
            chunk.dirty_id = self.next_dirty_id();
            chunk.flushed = false;
            self.next_dirty_id()
        } else {
            0
        };
        FileChunk {
            offset: chunk.offset + at as u64,
            dirty_id: tail_dirty_id,
            flushed: chunk.flushed,
            data: tail,
            buffer: Arc::clone(&chunk.buffer),
        }
    }

    /// 写入后把描述符标记为脏并分配新编号，返回该编号。
    ///
    /// 原本干净的描述符把整块长度计入脏字节。租约被多个描述符共享时返回 [`SharedLease`]，
    /// 描述符与记账均不变：部分覆盖写应改用
    /// [`BufferPool::alloc_chunk_from`](crate::BufferPool::alloc_chunk_from) 申请新的脏块。
    pub fn mark_dirty(&mut self, chunk: &mut FileChunk) -> Result<u64, SharedLease> {
        Self::exclusive(chunk)?;
        if !chunk.is_dirty() {
            self.add_dirty(chunk.buffer.len() as i64);
        }
        chunk.dirty_id = self.next_dirty_id();
        chunk.flushed = false;
        Ok(chunk.dirty_id)
    }

    /// 上传提交后把描述符标记为干净并扣减脏字节；共享租约的约束同 [`PoolGuard::mark_dirty`]。
    pub fn mark_clean(&mut self, chunk: &mut FileChunk) -> Result<(), SharedLease> {
        Self::exclusive(chunk)?;
        if chunk.is_dirty() {
            self.add_dirty(-(chunk.buffer.len() as i64));
        }
        chunk.dirty_id = 0;
        chunk.flushed = false;
        Ok(())
    }

    fn exclusive(chunk: &FileChunk) -> Result<(), SharedLease> {
        match chunk.buffer.refs() {
            1 => Ok(()),
            refs => Err(SharedLease { refs }),
        }
    }
}
