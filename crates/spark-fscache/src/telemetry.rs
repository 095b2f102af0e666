//! 内存遥测与动态 ceiling 计算。
//!
//! # 模块定位（Why）
//! - 缓冲池不预留固定大小的内存板，而是周期性采样“系统还剩多少可用内存”，
//!   以 `可用 + 本池已提交` 作为准入上限，使池随外部压力伸缩；
//! - 容器环境下 cgroup 的剩余额度往往比整机更紧，必须优先采用，但绝不信任比整机还宽松的 cgroup 数字。
//!
//! # 设计概要（How）
//! - [`MemoryProbe`] 把“查询可用内存”抽象为 trait，池只依赖该接口；
//! - [`SystemMemoryProbe`] 读取 `/proc/meminfo` 与 cgroup v2/v1 记账文件；
//! - [`StaticMemoryProbe`] 返回可编程的固定数字，供测试与嵌入场景使用；
//! - [`compute_ceiling`] 汇总探针结果、执行回退与硬上限裁剪。

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::TelemetryError;

/// cgroup v1 在未设限时报告的哨兵值（`PAGE_COUNTER_MAX` 按页对齐后的结果），超过即视为无限制。
const CGROUP_V1_UNLIMITED: u64 = 1 << 62;

/// 可用内存探针。
///
/// # 契约说明（What）
/// - `system_available`：整机可用内存字节数；
/// - `cgroup_available`：当前 cgroup 剩余额度字节数，未设限或不可得时返回错误；
/// - `release_free_memory`：在重新采样前把分配器持有的空闲内存交还给操作系统，
///   默认空实现（Rust 的全局分配器在释放时已直接归还）；
/// - 实现必须线程安全，调用发生在池锁内，不得阻塞在该池上。
pub trait MemoryProbe: Send + Sync + 'static {
    fn system_available(&self) -> Result<u64, TelemetryError>;

    fn cgroup_available(&self) -> Result<u64, TelemetryError>;

    fn release_free_memory(&self) {}
}

impl<T: MemoryProbe + ?Sized> MemoryProbe for Arc<T> {
    fn system_available(&self) -> Result<u64, TelemetryError> {
        (**self).system_available()
    }

    fn cgroup_available(&self) -> Result<u64, TelemetryError> {
        (**self).cgroup_available()
    }

    fn release_free_memory(&self) {
        (**self).release_free_memory()
    }
}

/// 根据遥测计算新的 ceiling。
///
/// # 教案式说明
/// - **逻辑 (How)**：
///   1. 读取整机可用内存；失败时不 panic，有硬上限则退回硬上限，否则沿用 `previous`；
///   2. 读取 cgroup 剩余额度；失败或大于整机数字时采用整机数字；
///   3. 候选值 = 可用 + `committed`（“可用”不含本池已提交的部分，释放与再增长以已持有量为中心对称）；
///   4. `limit > 0` 且候选值更大时裁剪为 `limit`。
/// - **契约 (What)**：该函数只产生日志，从不向调用方传播遥测错误。
pub fn compute_ceiling(probe: &dyn MemoryProbe, committed: u64, limit: u64, previous: u64) -> u64 {
    let system = match probe.system_available() {
        Ok(bytes) => bytes,
        Err(err) => {
            let fallback = if limit > 0 { limit } else { previous };
            warn!(error = %err, fallback, "system memory probe failed, ceiling not resampled");
            return fallback;
        }
    };

    let available = match probe.cgroup_available() {
        Ok(cgroup) if cgroup <= system => cgroup,
        Ok(cgroup) => {
            debug!(cgroup, system, "cgroup reports more room than the system, using system figure");
            system
        }
        Err(err) => {
            debug!(error = %err, "cgroup memory unavailable, using system figure");
            system
        }
    };

    let mut ceiling = available.saturating_add(committed);
    if limit > 0 && ceiling > limit {
        ceiling = limit;
    }
    debug!(
        available_mib = available >> 20,
        committed_mib = committed >> 20,
        ceiling_mib = ceiling >> 20,
        "recomputed buffer ceiling"
    );
    ceiling
}

/// 读取 Linux `/proc/meminfo` 与 cgroup 记账文件的探针。
#[derive(Clone, Debug)]
pub struct SystemMemoryProbe {
    meminfo: PathBuf,
    cgroup_root: PathBuf,
}

impl SystemMemoryProbe {
    pub fn new(cgroup_root: impl AsRef<Path>) -> Self {
        Self {
            meminfo: PathBuf::from("/proc/meminfo"),
            cgroup_root: cgroup_root.as_ref().to_path_buf(),
        }
    }

    /// 替换 meminfo 路径，便于在夹具目录中测试。
    pub fn with_meminfo_path(mut self, path: impl AsRef<Path>) -> Self {
        self.meminfo = path.as_ref().to_path_buf();
        self
    }

    fn cgroup_v2_available(&self) -> Result<u64, TelemetryError> {
        let max_path = self.cgroup_root.join("memory.max");
        let max = read_trimmed(&max_path)?;
        if max == "max" {
            return Err(TelemetryError::Unlimited { path: max_path });
        }
        let limit = parse_u64(&max_path, &max)?;
        let current_path = self.cgroup_root.join("memory.current");
        let current = parse_u64(&current_path, &read_trimmed(&current_path)?)?;
        Ok(limit.saturating_sub(current))
    }

    fn cgroup_v1_available(&self) -> Result<u64, TelemetryError> {
        let dir = self.cgroup_root.join("memory");
        let limit_path = dir.join("memory.limit_in_bytes");
        let limit = parse_u64(&limit_path, &read_trimmed(&limit_path)?)?;
        if limit >= CGROUP_V1_UNLIMITED {
            return Err(TelemetryError::Unlimited { path: limit_path });
        }
        let usage_path = dir.join("memory.usage_in_bytes");
        let usage = parse_u64(&usage_path, &read_trimmed(&usage_path)?)?;
        Ok(limit.saturating_sub(usage))
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_CGROUP_ROOT)
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn system_available(&self) -> Result<u64, TelemetryError> {
        let text = fs::read_to_string(&self.meminfo).map_err(|source| TelemetryError::Io {
            path: self.meminfo.clone(),
            source,
        })?;
        // MemAvailable 包含可回收的页缓存，老内核缺失时退回 MemFree。
        let kib = meminfo_field(&self.meminfo, &text, "MemAvailable:")
            .or_else(|_| meminfo_field(&self.meminfo, &text, "MemFree:"))?;
        Ok(kib.saturating_mul(1024))
    }

    fn cgroup_available(&self) -> Result<u64, TelemetryError> {
        match self.cgroup_v2_available() {
            Err(TelemetryError::Io { .. }) => self.cgroup_v1_available(),
            other => other,
        }
    }
}

fn meminfo_field(path: &Path, text: &str, field: &'static str) -> Result<u64, TelemetryError> {
    let line = text
        .lines()
        .find(|line| line.starts_with(field))
        .ok_or_else(|| TelemetryError::MissingField {
            path: path.to_path_buf(),
            field,
        })?;
    let value = line[field.len()..]
        .split_whitespace()
        .next()
        .ok_or_else(|| TelemetryError::MissingField {
            path: path.to_path_buf(),
            field,
        })?;
    parse_u64(path, value)
}

fn read_trimmed(path: &Path) -> Result<String, TelemetryError> {
    fs::read_to_string(path)
        .map(|text| text.trim().to_owned())
        .map_err(|source| TelemetryError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn parse_u64(path: &Path, value: &str) -> Result<u64, TelemetryError> {
    value.parse().map_err(|_| TelemetryError::Parse {
        path: path.to_path_buf(),
        value: value.to_owned(),
    })
}

/// 返回固定数字的探针。
///
/// `None` 表示对应查询失败；`release_free_memory` 的调用次数会被记录，
/// 便于断言池在预期时机重新采样。
#[derive(Debug, Default)]
pub struct StaticMemoryProbe {
    system: Mutex<Option<u64>>,
    cgroup: Mutex<Option<u64>>,
    releases: AtomicU64,
}

impl StaticMemoryProbe {
    pub fn new(system_available: u64) -> Self {
        Self {
            system: Mutex::new(Some(system_available)),
            cgroup: Mutex::new(None),
            releases: AtomicU64::new(0),
        }
    }

    pub fn with_cgroup(self, cgroup_available: u64) -> Self {
        *self.cgroup.lock() = Some(cgroup_available);
        self
    }

    pub fn set_system_available(&self, bytes: Option<u64>) {
        *self.system.lock() = bytes;
    }

    pub fn set_cgroup_available(&self, bytes: Option<u64>) {
        *self.cgroup.lock() = bytes;
    }

    /// `release_free_memory` 被调用的次数，等价于重新采样的次数。
    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::Relaxed)
    }
}

impl MemoryProbe for StaticMemoryProbe {
    fn system_available(&self) -> Result<u64, TelemetryError> {
        let system = *self.system.lock();
        system.ok_or_else(|| TelemetryError::MissingField {
            path: PathBuf::from("<static>"),
            field: "MemAvailable:",
        })
    }

    fn cgroup_available(&self) -> Result<u64, TelemetryError> {
        let cgroup = *self.cgroup.lock();
        cgroup.ok_or_else(|| TelemetryError::Unlimited {
            path: PathBuf::from("<static>"),
        })
    }

    fn release_free_memory(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    /// 在系统临时目录下创建夹具目录，名称包含进程号避免并发测试互相覆盖。
    fn fixture_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("spark-fscache-{}-{name}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).expect("创建夹具目录");
        dir
    }

    #[test]
    fn ceiling_is_clamped_to_configured_limit() {
        let probe = StaticMemoryProbe::new(1000);
        assert_eq!(compute_ceiling(&probe, 0, 500, 0), 500);
        assert_eq!(compute_ceiling(&probe, 200, 500, 0), 500);
        assert_eq!(compute_ceiling(&probe, 200, 0, 0), 1200, "未设限时为可用 + 已提交");
    }

    #[test]
    fn cgroup_figure_wins_only_when_tighter() {
        let probe = StaticMemoryProbe::new(1000).with_cgroup(300);
        assert_eq!(compute_ceiling(&probe, 50, 0, 0), 350);

        probe.set_cgroup_available(Some(5000));
        assert_eq!(compute_ceiling(&probe, 50, 0, 0), 1050, "不信任比整机更宽松的 cgroup 数字");
    }

    #[traced_test]
    #[test]
    fn cgroup_failure_falls_back_to_system_figure() {
        let probe = StaticMemoryProbe::new(800);
        assert_eq!(compute_ceiling(&probe, 0, 0, 0), 800);
        assert!(logs_contain("cgroup memory unavailable"));
    }

    #[traced_test]
    #[test]
    fn system_failure_keeps_previous_or_limit() {
        let probe = StaticMemoryProbe::new(0);
        probe.set_system_available(None);
        assert_eq!(compute_ceiling(&probe, 10, 0, 777), 777);
        assert_eq!(compute_ceiling(&probe, 10, 64, 777), 64);
        assert!(logs_contain("system memory probe failed"));
    }

    #[test]
    fn meminfo_prefers_mem_available() {
        let dir = fixture_dir("meminfo");
        let meminfo = dir.join("meminfo");
        fs::write(
            &meminfo,
            "MemTotal:       16000 kB\nMemFree:          100 kB\nMemAvailable:    2048 kB\n",
        )
        .expect("写入 meminfo");
        let probe = SystemMemoryProbe::new(&dir).with_meminfo_path(&meminfo);
        assert_eq!(probe.system_available().expect("读取可用内存"), 2048 * 1024);

        fs::write(&meminfo, "MemTotal: 16000 kB\nMemFree: 100 kB\n").expect("写入旧格式 meminfo");
        assert_eq!(probe.system_available().expect("回退到 MemFree"), 100 * 1024);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn cgroup_v2_and_v1_files_are_understood() {
        let dir = fixture_dir("cgroup-v2");
        fs::write(dir.join("memory.max"), "4096\n").expect("写入 memory.max");
        fs::write(dir.join("memory.current"), "1024\n").expect("写入 memory.current");
        let probe = SystemMemoryProbe::new(&dir);
        assert_eq!(probe.cgroup_available().expect("v2 额度"), 3072);

        fs::write(dir.join("memory.max"), "max\n").expect("写入无限制");
        assert!(matches!(
            probe.cgroup_available(),
            Err(TelemetryError::Unlimited { .. })
        ));
        let _ = fs::remove_dir_all(&dir);

        let dir = fixture_dir("cgroup-v1");
        fs::create_dir_all(dir.join("memory")).expect("创建 v1 目录");
        fs::write(dir.join("memory/memory.limit_in_bytes"), "10000").expect("写入 v1 上限");
        fs::write(dir.join("memory/memory.usage_in_bytes"), "2500").expect("写入 v1 用量");
        let probe = SystemMemoryProbe::new(&dir);
        assert_eq!(probe.cgroup_available().expect("v1 额度"), 7500);

        fs::write(dir.join("memory/memory.limit_in_bytes"), "9223372036854771712")
            .expect("写入 v1 哨兵值");
        assert!(matches!(
            probe.cgroup_available(),
            Err(TelemetryError::Unlimited { .. })
        ));
        let _ = fs::remove_dir_all(&dir);
    }
}
