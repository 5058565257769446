use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::link::parse_link;
use crate::server::{Provenance, ServerRecord};

/// 持久化的注册表内容
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryState {
    /// 用户服务器
    #[serde(default)]
    pub user: Vec<ServerRecord>,
    /// 订阅服务器
    #[serde(default)]
    pub subscription: Vec<ServerRecord>,
    /// 当前选中的服务器ID，空表示未选择
    #[serde(default)]
    pub selected: String,
}

impl RegistryState {
    fn partition_mut(&mut self, provenance: Provenance) -> &mut Vec<ServerRecord> {
        match provenance {
            Provenance::User => &mut self.user,
            Provenance::Subscription => &mut self.subscription,
        }
    }

    fn iter(&self) -> impl Iterator<Item = &ServerRecord> {
        self.user.iter().chain(self.subscription.iter())
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut ServerRecord> {
        self.user.iter_mut().chain(self.subscription.iter_mut())
    }

    fn contains_url(&self, url: &str) -> bool {
        self.iter().any(|s| s.url == url)
    }

    /// 删除满足条件的服务器，当前选中的服务器不会被删除
    fn retain_or_evict<F>(&mut self, mut evict: F) -> Vec<ServerRecord>
    where
        F: FnMut(&ServerRecord) -> bool,
    {
        let selected = self.selected.clone();
        let mut removed = Vec::new();
        for partition in [&mut self.user, &mut self.subscription] {
            let (gone, kept): (Vec<_>, Vec<_>) = partition
                .drain(..)
                .partition(|s| s.id != selected && evict(s));
            *partition = kept;
            removed.extend(gone);
        }
        removed
    }
}

/// 服务器注册表，两个来源分区共用一把读写锁
#[derive(Debug, Clone)]
pub struct Registry {
    state: Arc<RwLock<RegistryState>>,
    path: Option<Arc<PathBuf>>,
    write_lock: Arc<Mutex<()>>,
}

impl Registry {
    /// 不落盘的注册表
    pub fn in_memory() -> Self {
        Self::with_state(RegistryState::default(), None)
    }

    fn with_state(state: RegistryState, path: Option<PathBuf>) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
            path: path.map(Arc::new),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// 从状态文件加载，文件不存在时为空
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let content = fs::read_to_string(&path)?;
            let state: RegistryState = serde_json::from_str(&content)?;
            info!(
                "已加载 {} 个用户服务器, {} 个订阅服务器",
                state.user.len(),
                state.subscription.len()
            );
            state
        } else {
            debug!("状态文件不存在，使用空注册表: {}", path.display());
            RegistryState::default()
        };
        Ok(Self::with_state(state, Some(path)))
    }

    /// 原子写入状态文件（先写临时文件再重命名）
    pub async fn persist(&self) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;
        let content = {
            let state = self.state.read().await;
            serde_json::to_string_pretty(&*state)?
        };

        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        fs::create_dir_all(dir)?;
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(content.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(path).map_err(|e| Error::Io(e.error))?;
        debug!("状态已保存到 {}", path.display());
        Ok(())
    }

    /// 两个分区的快照
    pub async fn snapshot(&self) -> Vec<ServerRecord> {
        self.state.read().await.iter().cloned().collect()
    }

    pub async fn partition(&self, provenance: Provenance) -> Vec<ServerRecord> {
        let state = self.state.read().await;
        match provenance {
            Provenance::User => state.user.clone(),
            Provenance::Subscription => state.subscription.clone(),
        }
    }

    pub async fn len(&self) -> usize {
        let state = self.state.read().await;
        state.user.len() + state.subscription.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn get(&self, id: &str) -> Option<ServerRecord> {
        self.state.read().await.iter().find(|s| s.id == id).cloned()
    }

    /// 用户手动添加链接
    pub async fn add_user_link(&self, url: &str) -> Result<ServerRecord> {
        let url = url.trim();
        let record = {
            let mut state = self.state.write().await;
            if state.contains_url(url) {
                return Err(Error::Duplicate(url.to_string()));
            }
            let record = ServerRecord::from_link(url, parse_link(url)?, Provenance::User)?;
            state.user.push(record.clone());
            record
        };
        info!("添加服务器 [{}] {}", record.name, record.host);
        self.persist().await?;
        Ok(record)
    }

    /// 合并订阅候选，已存在的链接跳过，返回新增数量。不落盘。
    pub async fn merge(&self, candidates: Vec<ServerRecord>) -> usize {
        let mut state = self.state.write().await;
        let mut seen: HashSet<String> = state.iter().map(|s| s.url.clone()).collect();
        let mut added = 0;
        for mut candidate in candidates {
            if !seen.insert(candidate.url.clone()) {
                continue;
            }
            candidate.provenance = Provenance::Subscription;
            candidate.reset_health();
            debug!("新增订阅服务器 [{}] {}", candidate.name, candidate.host);
            state.subscription.push(candidate);
            added += 1;
        }
        added
    }

    /// 在分区间移动服务器，已在目标分区时返回 `false`
    pub async fn move_to(&self, id: &str, target: Provenance) -> Result<bool> {
        let source = match target {
            Provenance::User => Provenance::Subscription,
            Provenance::Subscription => Provenance::User,
        };
        {
            let mut state = self.state.write().await;
            if state.partition_mut(target).iter().any(|s| s.id == id) {
                return Ok(false);
            }
            let from = state.partition_mut(source);
            let index = from
                .iter()
                .position(|s| s.id == id)
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            let mut record = from.remove(index);
            record.provenance = target;
            state.partition_mut(target).push(record);
        }
        self.persist().await?;
        Ok(true)
    }

    pub async fn move_to_user(&self, id: &str) -> Result<bool> {
        self.move_to(id, Provenance::User).await
    }

    pub async fn move_to_subscription(&self, id: &str) -> Result<bool> {
        self.move_to(id, Provenance::Subscription).await
    }

    /// 修改单个服务器，返回服务器是否还存在
    pub async fn update<F>(&self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut ServerRecord),
    {
        let mut state = self.state.write().await;
        let found = state.iter_mut().find(|s| s.id == id);
        match found {
            Some(server) => {
                f(server);
                true
            }
            None => false,
        }
    }

    /// 按条件移除服务器（跳过当前选中的服务器）。不落盘。
    pub async fn evict_where<F>(&self, evict: F) -> Vec<ServerRecord>
    where
        F: FnMut(&ServerRecord) -> bool,
    {
        let removed = self.state.write().await.retain_or_evict(evict);
        for server in &removed {
            warn!("服务器已移除: [{}] {}", server.name, server.host);
        }
        removed
    }

    /// 移除连通性连续失败超过阈值的服务器
    pub async fn remove_failed(&self, threshold: u32) -> Result<usize> {
        let removed = self.evict_where(|s| s.conn_failure_streak > threshold).await;
        if !removed.is_empty() {
            self.persist().await?;
        }
        Ok(removed.len())
    }

    /// 清空一个分区（当前选中的服务器保留）
    pub async fn clear(&self, provenance: Provenance) -> Result<usize> {
        let removed = self.evict_where(|s| s.provenance == provenance).await;
        self.persist().await?;
        Ok(removed.len())
    }

    /// 当前选中的服务器ID
    pub async fn selected(&self) -> Option<String> {
        let state = self.state.read().await;
        (!state.selected.is_empty()).then(|| state.selected.clone())
    }

    pub async fn selected_server(&self) -> Option<ServerRecord> {
        let id = self.selected().await?;
        self.get(&id).await
    }

    /// 记录选中的服务器并立即落盘
    pub async fn set_selected(&self, id: &str) -> Result<()> {
        self.state.write().await.selected = id.to_string();
        self.persist().await
    }
}
