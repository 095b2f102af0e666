//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义缓冲池对外可见的全部错误语义：致命的内存耗尽、遥测采样失败与配置解析失败；
//! - 与池内部的“可恢复压力”区分开：后者由驱逐与阻塞在池内消化，从不以错误值出现在调用方面前。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 `thiserror::Error`，可直接交给 `anyhow` 等上层框架处理；
//! - [`OutOfMemory`] 是唯一的致命路径，调用方不得重试，只能终止进程。

use std::{io, path::PathBuf};

use thiserror::Error;

/// 准入请求在穷尽所有补救手段后仍无法满足。
///
/// # 教案式说明
/// - **意图 (Why)**：池内已没有任何在途缓冲（无可驱逐、无可刷写），重新采样遥测后单次请求仍然超过上限，
///   说明调用方在请求一块系统永远无法提供的内存，属于容量规划错误而非瞬时压力。
/// - **契约 (What)**：`requested` 为本次请求字节数，`committed` 与 `ceiling` 为判定瞬间的池状态；
///   持有该值的调用方必须调用 [`OutOfMemory::abort`] 或在顶层入口执行等价的受控退出。
/// - **风险 (Trade-offs)**：以错误值而非 panic 传递，是为了让宿主有机会刷新日志；
///   但池的记账在此之后不再保证可用，继续运行是未定义的业务行为。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[must_use = "OutOfMemory 是致命条件，必须终止进程"]
#[error(
    "unable to allocate {requested} bytes: {committed} bytes committed, ceiling is {ceiling} bytes"
)]
pub struct OutOfMemory {
    pub requested: u64,
    pub committed: u64,
    pub ceiling: u64,
}

impl OutOfMemory {
    /// 记录错误并立即中止进程。
    pub fn abort(self) -> ! {
        tracing::error!(
            requested = self.requested,
            committed = self.committed,
            ceiling = self.ceiling,
            "buffer pool exhausted, aborting"
        );
        std::process::abort()
    }
}

/// 试图改变一个与其它描述符共享租约的块的脏净分类。
///
/// 同一租约的全部描述符必须同属脏或同属干净，释放时才能按最后一个描述符正确归还脏字节。
/// 部分覆盖写应把新数据写入新申请的脏块，再拆分并释放旧块中被覆盖的一段。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("chunk shares its buffer with {refs} descriptors, its dirty state cannot change alone")]
pub struct SharedLease {
    pub refs: usize,
}

/// 读取系统或 cgroup 内存遥测时的失败。
///
/// 这些错误只在 `telemetry` 模块内部流转：cgroup 失败回退到系统口径，
/// 系统口径失败回退到配置上限或上一次的 ceiling。
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to read `{path}`")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("`{field}` not found in `{path}`")]
    MissingField { path: PathBuf, field: &'static str },

    #[error("unparsable value `{value}` in `{path}`")]
    Parse { path: PathBuf, value: String },

    /// cgroup 未设置内存上限（v2 的 `max`，或 v1 的超大哨兵值）。
    #[error("cgroup at `{path}` has no memory limit")]
    Unlimited { path: PathBuf },
}

/// 配置装载失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file `{path}`")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid buffer pool configuration")]
    Toml(#[from] toml::de::Error),

    #[error("invalid byte size `{0}`")]
    ByteSize(String),

    #[error("recompute_interval must be at least 1")]
    ZeroRecomputeInterval,
}
