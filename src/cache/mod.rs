use crate::error::{Error, Result};
use crate::models::{ModelInfo, ModelsResponse};
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;

/// 模型目录缓存
///
/// 使用DashMap实现线程安全的并发读取。
/// 请求路径上只调用 `get` / `list`，写入只发生在后台刷新任务中，
/// 因此对单个请求来说目录就是一个只读快照。
///
/// 条目没有单独的过期时间：快照一直有效，直到下一次成功的刷新整体替换它。
/// 刷新失败或只有种子文件时，继续使用最后一份目录。
///
/// 未命中不是错误：路由策略会走默认的 Chat Completions 端点。
#[derive(Clone, Default)]
pub struct Cache {
    /// Key: 模型ID
    storage: Arc<DashMap<String, Arc<ModelInfo>>>,
}

impl Cache {
    /// 创建空的目录缓存
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取模型能力信息，未命中返回 `None`
    pub fn get(&self, model_id: &str) -> Option<Arc<ModelInfo>> {
        self.storage.get(model_id).map(|entry| entry.value().clone())
    }

    /// 用一份完整的目录替换当前快照
    ///
    /// 不在新目录中的模型会被移除
    pub fn replace_all(&self, models: Vec<ModelInfo>) {
        self.storage
            .retain(|id, _| models.iter().any(|m| &m.id == id));

        for model in models {
            self.storage.insert(model.id.clone(), Arc::new(model));
        }
    }

    /// 从YAML种子文件加载目录
    ///
    /// 文件格式与上游 /models 响应一致（`data: [...]`）
    pub fn load_yaml_seed(&self, path: &Path) -> Result<usize> {
        let content = std::fs::read_to_string(path)?;
        let seed: ModelsResponse =
            serde_yaml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
        let count = seed.data.len();
        self.replace_all(seed.data);
        Ok(count)
    }

    /// 当前目录中的所有模型，按ID排序
    pub fn list(&self) -> Vec<Arc<ModelInfo>> {
        let mut models: Vec<Arc<ModelInfo>> = self.storage.iter().map(|entry| entry.value().clone()).collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }
}
