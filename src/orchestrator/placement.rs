//! プラットフォームPodの配置ヒント
//!
//! プラットフォーム自身のPodからnodeSelectorを一度だけ取得し、管理対象の
//! すべてのワークロードへ同じスケジューリング制約を適用します。
//! 取得失敗は警告のみで、呼び出し元の処理を失敗させることはありません。

use super::cluster::ClusterClient;
use super::types::NodeSelector;
use k8s_openapi::api::core::v1::Pod;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// 取得結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementState {
    /// 未取得
    NotFetched,
    /// 取得失敗（nodeSelectorなしとして扱う）
    FetchFailed,
    /// Podは見つかったがnodeSelectorなし
    Absent,
    /// nodeSelectorあり
    Found(NodeSelector),
}

impl PlacementState {
    pub fn node_selector(&self) -> Option<NodeSelector> {
        match self {
            PlacementState::Found(selector) => Some(selector.clone()),
            _ => None,
        }
    }
}

/// プラットフォームPodの識別方法
#[derive(Debug, Clone, Default)]
pub struct PlatformIdentity {
    /// POD_NAME / HOSTNAME から得たPod名
    pub pod_name: Option<String>,
    /// Pod名が不明な場合に使うラベルセレクター
    pub label_selector: String,
}

/// nodeSelectorのメモ化キャッシュ（single-flight）
pub struct PlacementCache {
    identity: PlatformIdentity,
    state: Mutex<PlacementState>,
    fetch_gate: tokio::sync::Mutex<()>,
}

impl PlacementCache {
    pub fn new(identity: PlatformIdentity) -> Self {
        Self {
            identity,
            state: Mutex::new(PlacementState::NotFetched),
            fetch_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// 現在のキャッシュ状態
    pub fn state(&self) -> PlacementState {
        self.lock_state().clone()
    }

    /// テスト用のリセット
    pub fn reset(&self) {
        *self.lock_state() = PlacementState::NotFetched;
    }

    /// nodeSelectorを取得（初回のみAPI呼び出し）
    pub async fn node_selector(&self, client: &dyn ClusterClient) -> Option<NodeSelector> {
        if let Some(cached) = self.cached() {
            return cached;
        }

        let _gate = self.fetch_gate.lock().await;
        // 待機中に別の呼び出しが取得済みの可能性がある
        if let Some(cached) = self.cached() {
            return cached;
        }

        let state = self.fetch(client).await;
        let selector = state.node_selector();
        *self.lock_state() = state;
        selector
    }

    fn cached(&self) -> Option<Option<NodeSelector>> {
        match &*self.lock_state() {
            PlacementState::NotFetched => None,
            state => Some(state.node_selector()),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PlacementState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn fetch(&self, client: &dyn ClusterClient) -> PlacementState {
        match self.find_platform_pod(client).await {
            Ok(Some(pod)) => {
                let pod_name = pod.metadata.name.clone().unwrap_or_default();
                match pod
                    .spec
                    .and_then(|spec| spec.node_selector)
                    .filter(|selector| !selector.is_empty())
                {
                    Some(selector) => {
                        info!(pod = %pod_name, ?selector, "Inheriting platform nodeSelector");
                        PlacementState::Found(selector)
                    }
                    None => {
                        debug!(pod = %pod_name, "Platform pod has no nodeSelector");
                        PlacementState::Absent
                    }
                }
            }
            Ok(None) => {
                warn!("Platform pod not found, workloads will have no nodeSelector");
                PlacementState::FetchFailed
            }
            Err(e) => {
                warn!(error = %e, "Failed to fetch platform nodeSelector");
                PlacementState::FetchFailed
            }
        }
    }

    async fn find_platform_pod(
        &self,
        client: &dyn ClusterClient,
    ) -> Result<Option<Pod>, super::cluster::ClusterError> {
        if let Some(name) = &self.identity.pod_name {
            return match client.get_pod(name).await {
                Ok(pod) => Ok(Some(pod)),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e),
            };
        }

        let pods = client.list_pods(&self.identity.label_selector).await?;
        Ok(pods.into_iter().find(|pod| {
            pod.status
                .as_ref()
                .and_then(|status| status.phase.as_deref())
                == Some("Running")
        }))
    }
}
