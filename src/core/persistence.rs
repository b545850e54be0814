//! 运行快照持久化
//!
//! 将 RunSnapshot 写入/从 JSON 文件加载，用于进程重启后恢复运行。

use std::path::{Path, PathBuf};

use crate::core::state::RunSnapshot;

/// 单文件 JSON 持久化
#[derive(Debug)]
pub struct RunStatePersistence {
    path: PathBuf,
}

impl RunStatePersistence {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// `dir/<run_id>.json`
    pub fn for_run(dir: impl AsRef<Path>, run_id: &str) -> Self {
        Self::new(dir.as_ref().join(format!("{run_id}.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 文件不存在时返回 None
    pub fn load(&self) -> anyhow::Result<Option<RunSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(&self.path)?;
        Ok(Some(RunSnapshot::from_blob(&data)?))
    }

    /// 父目录不存在时自动创建
    pub fn save(&self, snapshot: &RunSnapshot) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(snapshot)?)?;
        Ok(())
    }
}
