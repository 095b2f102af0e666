//! `spark-fscache` 是文件系统缓存层的内存准入与缓冲生命周期引擎。
//!
//! # 模块定位（Why）
//! - 缓存层在把文件内容持久化到远端对象存储之前先把它们放在内存里；
//!   本 crate 把缓存总量约束在动态探测的系统内存预算之内，并在众多文件句柄之间仲裁这份预算；
//! - 拆分或部分覆盖一个缓存区间时不复制数据：多个块描述符共享同一块分配，
//!   引用计数保证已提交字节数始终等于真实分配的字节数。
//!
//! # 设计概要（How）
//! - `pool` 模块实现 [`BufferPool`]：准入、释放、脏字节记账、驱逐回调与阻塞唤醒；
//! - `chunk` 模块实现 [`SharedBuffer`] 与 [`FileChunk`]，以及持锁形式的拆分、释放操作；
//! - `telemetry` 模块采样系统与 cgroup 可用内存并计算 ceiling；
//! - `reader` 模块把一组切片呈现为 `Read + Seek` 流，供读路径与上传路径使用；
//! - `config` 与 `error` 模块承载配置装载与错误分类。
//!
//! # 契约边界（What）
//! - 本 crate 只负责计数、阻塞、唤醒与释放；选择驱逐哪些块、何时刷写，由注入的
//!   [`CleanBufferEvictor`] 与外部刷写器决定；
//! - 只输出 `tracing` 事件，从不安装全局 Subscriber。

mod chunk;
mod config;
mod error;
mod pool;
mod reader;
mod telemetry;

pub use chunk::{FileChunk, SharedBuffer};
pub use config::{
    BufferPoolConfig, DEFAULT_CGROUP_ROOT, DEFAULT_RECOMPUTE_INTERVAL, parse_byte_size,
};
pub use error::{ConfigError, OutOfMemory, SharedLease, TelemetryError};
pub use pool::{BufferPool, CleanBufferEvictor, NoEviction, OwnerId, PoolGuard, PoolStats};
pub use reader::MultiSliceReader;
pub use telemetry::{MemoryProbe, StaticMemoryProbe, SystemMemoryProbe, compute_ceiling};
