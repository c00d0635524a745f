//! 部署产物传输
//!
//! 把生成的配置文件和服务源码目录放到远端固定项目路径下。
//! 本地缺失的路径视为可选、静默跳过；存在的路径上的读取 /
//! 传输失败才会上抛。

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{DeployError, DeployResult};
use crate::infra::ssh::RemoteSession;

/// 产物传输器
pub struct ArtifactTransfer;

impl ArtifactTransfer {
    /// 上传文件列表与目录列表到远端根路径
    ///
    /// 文件直接放置；目录保持相对结构递归复制，
    /// 先幂等创建远端目录再深度优先复制内容
    pub async fn upload(
        session: &mut dyn RemoteSession,
        files: &[PathBuf],
        directories: &[PathBuf],
        remote_root: &str,
    ) -> DeployResult<usize> {
        session.ensure_dir(remote_root).await?;
        let mut uploaded = 0;

        for file in files {
            if !file.is_file() {
                debug!(path = %file.display(), "Local file missing, skipping");
                continue;
            }
            let name = file_name(file)?;
            let remote_path = format!("{}/{}", remote_root, name);
            Self::put_file(session, file, &remote_path).await?;
            uploaded += 1;
        }

        for dir in directories {
            if !dir.is_dir() {
                debug!(path = %dir.display(), "Local directory missing, skipping");
                continue;
            }
            let name = file_name(dir)?;
            let remote_dir = format!("{}/{}", remote_root, name);
            uploaded += Self::put_directory(session, dir, &remote_dir).await?;
        }

        info!(remote_root = %remote_root, uploaded = uploaded, "Artifact upload finished");
        Ok(uploaded)
    }

    async fn put_file(
        session: &mut dyn RemoteSession,
        local: &Path,
        remote_path: &str,
    ) -> DeployResult<()> {
        let contents = tokio::fs::read(local).await.map_err(|e| {
            DeployError::Transfer(format!("failed to read {}: {}", local.display(), e))
        })?;
        debug!(local = %local.display(), remote = %remote_path, bytes = contents.len(), "Uploading file");
        session.write_file(remote_path, &contents).await
    }

    /// 递归复制目录，迭代式深度优先（避免装箱递归 future）
    async fn put_directory(
        session: &mut dyn RemoteSession,
        local_dir: &Path,
        remote_dir: &str,
    ) -> DeployResult<usize> {
        let mut uploaded = 0;
        let mut pending: Vec<(PathBuf, String)> =
            vec![(local_dir.to_path_buf(), remote_dir.to_string())];

        while let Some((dir, remote)) = pending.pop() {
            session.ensure_dir(&remote).await?;

            let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| {
                DeployError::Transfer(format!("failed to list {}: {}", dir.display(), e))
            })?;

            while let Some(entry) = entries.next_entry().await.map_err(|e| {
                DeployError::Transfer(format!("failed to list {}: {}", dir.display(), e))
            })? {
                let path = entry.path();
                let name = file_name(&path)?;
                let remote_path = format!("{}/{}", remote, name);
                let file_type = entry.file_type().await.map_err(|e| {
                    DeployError::Transfer(format!("failed to stat {}: {}", path.display(), e))
                })?;

                if file_type.is_dir() {
                    pending.push((path, remote_path));
                } else if file_type.is_file() {
                    Self::put_file(session, &path, &remote_path).await?;
                    uploaded += 1;
                }
                // 符号链接等其他类型不复制
            }
        }

        Ok(uploaded)
    }
}

fn file_name(path: &Path) -> DeployResult<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_string())
        .ok_or_else(|| {
            DeployError::Transfer(format!("path {} has no usable file name", path.display()))
        })
}
