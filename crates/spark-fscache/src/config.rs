use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;

/// 每累计多少次准入请求重新采样一次内存遥测。
pub const DEFAULT_RECOMPUTE_INTERVAL: u64 = 16;

/// cgroup 文件系统的默认挂载点。
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// `BufferPoolConfig` 描述缓冲池构造时的全部静态参数。
///
/// # 教案式说明
/// - **意图 (Why)**：池是显式构造、按引用传递的实例，所有可调参数集中在此处，
///   测试可以为每个用例构造互不干扰的池。
/// - **契约 (What)**：
///   - `limit`：硬上限字节数，0 表示不额外设限（仍受系统遥测约束）；
///     TOML 中既可写整数，也可写 `"512MiB"` 这类带单位的字符串；
///   - `recompute_interval`：两次遥测采样之间的准入请求数，至少为 1；
///   - `cgroup_root`：`SystemMemoryProbe` 查找 cgroup 记账文件的根目录。
/// - **风险 (Trade-offs)**：`recompute_interval` 越小越能及时感知外部压力，但每次采样都要读 `/proc` 与 cgroup 文件。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BufferPoolConfig {
    #[serde(deserialize_with = "deserialize_byte_size")]
    pub limit: u64,
    pub recompute_interval: u64,
    pub cgroup_root: PathBuf,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            limit: 0,
            recompute_interval: DEFAULT_RECOMPUTE_INTERVAL,
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
        }
    }
}

impl BufferPoolConfig {
    /// 从 TOML 文本解析并校验配置。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// 读取 TOML 文件并解析、校验配置。
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// 设置硬上限，0 表示仅受遥测约束。
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_recompute_interval(mut self, interval: u64) -> Self {
        self.recompute_interval = interval;
        self
    }

    pub fn with_cgroup_root(mut self, root: impl AsRef<Path>) -> Self {
        self.cgroup_root = root.as_ref().to_path_buf();
        self
    }

    /// 校验字段间约束。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.recompute_interval == 0 {
            return Err(ConfigError::ZeroRecomputeInterval);
        }
        Ok(())
    }
}

/// 解析字节数：纯整数，或带 `K/KB/KiB/M/MB/MiB/G/GB/GiB/T/TB/TiB` 后缀（均按 1024 进制）。
///
/// 后缀大小写不敏感，数字与后缀之间允许空白。
pub fn parse_byte_size(input: &str) -> Result<u64, ConfigError> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);
    if digits.is_empty() {
        return Err(ConfigError::ByteSize(input.to_owned()));
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| ConfigError::ByteSize(input.to_owned()))?;
    let shift = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 0,
        "k" | "kb" | "kib" => 10,
        "m" | "mb" | "mib" => 20,
        "g" | "gb" | "gib" => 30,
        "t" | "tb" | "tib" => 40,
        _ => return Err(ConfigError::ByteSize(input.to_owned())),
    };
    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| ConfigError::ByteSize(input.to_owned()))
}

fn deserialize_byte_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bytes(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Bytes(bytes) => Ok(bytes),
        Raw::Text(text) => parse_byte_size(&text).map_err(serde::de::Error::custom),
    }
}
