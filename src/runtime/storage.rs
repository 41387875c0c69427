use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::runtime::instance::WorkflowInstanceData;

/// 持久化端口
/// 配置后引擎在每次状态迁移后调用 save_instance；未配置时纯内存运行。
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn save_instance(&self, instance: &WorkflowInstanceData) -> Result<()>;
    async fn load_instance(&self, id: Uuid) -> Result<Option<WorkflowInstanceData>>;
}

/// 内存实现，测试和单机运行用
#[derive(Default)]
pub struct InMemoryInstanceStore {
    instances: DashMap<Uuid, WorkflowInstanceData>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn save_instance(&self, instance: &WorkflowInstanceData) -> Result<()> {
        self.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn load_instance(&self, id: Uuid) -> Result<Option<WorkflowInstanceData>> {
        Ok(self.instances.get(&id).map(|i| i.value().clone()))
    }
}
