use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::common::{EngineError, ReconcileErrors, TunnelError};
use crate::options::{auto_tag, is_category, is_sentinel, Member, MANAGED};

use super::{Status, Tunnel};

/// 一次调和的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub removed: Vec<String>,
    pub added: Vec<String>,
    pub unchanged: Vec<String>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

impl Tunnel {
    /// 用新的成员列表调和分类的 selector 与 url-test 组
    ///
    /// 先删后增；选项未变的成员不做任何操作。单个成员失败不影响其余成员，
    /// 失败在最后一并返回。引擎关闭、上下文取消、组缺失会立即返回。
    pub async fn update_group(
        &self,
        category: &str,
        members: Vec<Member>,
    ) -> Result<ReconcileReport, TunnelError> {
        let mut opts = self.opts.lock().await;

        let status = self.status();
        if status != Status::Running {
            return Err(TunnelError::NotReady(status));
        }
        let handles = self.handles().ok_or(TunnelError::NotReady(status))?;
        if handles.cancel.is_cancelled() {
            return Err(TunnelError::Cancelled);
        }
        if !is_category(category) {
            return Err(TunnelError::InvalidSelection(format!(
                "unknown category '{}'",
                category
            )));
        }
        if members.is_empty() {
            debug!(category, "empty member list, nothing to reconcile");
            return Ok(ReconcileReport::default());
        }

        let auto = auto_tag(category);
        let engine = &handles.engine;
        let om = engine.outbound_manager();
        let selector = om.selector(category)?.ok_or_else(|| {
            TunnelError::InvariantViolation(format!("selector '{}' missing", category))
        })?;
        let group = om.url_test(&auto)?.ok_or_else(|| {
            TunnelError::InvariantViolation(format!("url-test group '{}' missing", auto))
        })?;

        // 新列表按 tag 去重，保留首次出现
        let mut seen = HashSet::new();
        let mut incoming = Vec::with_capacity(members.len());
        for member in members {
            if seen.insert(member.tag.clone()) {
                incoming.push(member);
            } else {
                warn!(category, tag = member.tag.as_str(), "duplicate tag in server list ignored");
            }
        }

        let mut report = ReconcileReport::default();
        let mut failures = ReconcileErrors::default();

        // 选项不变的成员不参与增删
        let mut to_add = Vec::new();
        for member in incoming {
            let serialized = member.serialized();
            if opts.get(&member.tag) == Some(&serialized) && selector.contains(&member.tag).await {
                report.unchanged.push(member.tag);
            } else {
                to_add.push((member, serialized));
            }
        }
        let keep: HashSet<&str> = report.unchanged.iter().map(String::as_str).collect();

        for tag in selector.members().await {
            if tag == auto || keep.contains(tag.as_str()) {
                continue;
            }
            selector.remove(&tag).await;
            group.remove(&tag).await;
            if is_sentinel(&tag) {
                debug!(category, tag = tag.as_str(), "sentinel pruned from groups");
                report.removed.push(tag);
                continue;
            }
            match engine.remove_member(&tag) {
                Ok(()) => {
                    opts.remove(&tag);
                    report.removed.push(tag);
                }
                Err(EngineError::Closed) => return Err(TunnelError::EngineClosed),
                Err(err) => failures.push(&tag, "remove", err),
            }
        }

        if handles.cancel.is_cancelled() {
            return Err(TunnelError::Cancelled);
        }

        // 占位组（只有哨兵）第一次被填充：自动组回到 selector 头部
        if !selector.contains(&auto).await {
            selector.insert_front(&auto).await;
        }

        for (member, serialized) in to_add {
            if is_sentinel(&member.tag) {
                failures.push(&member.tag, "create", EngineError::DuplicateTag(member.tag.clone()));
                continue;
            }
            // 分类组只容纳普通成员
            if member.is_group() {
                failures.push(
                    &member.tag,
                    "create",
                    EngineError::UnsupportedProtocol {
                        tag: member.tag.clone(),
                        protocol: member.protocol.clone(),
                    },
                );
                continue;
            }
            match engine.create_member(&member) {
                Ok(()) => {}
                Err(EngineError::Closed) => return Err(TunnelError::EngineClosed),
                Err(err) => {
                    failures.push(&member.tag, "create", err);
                    continue;
                }
            }
            selector.add(&member.tag).await;
            group.add(&member.tag).await;
            opts.insert(member.tag.clone(), serialized);
            report.added.push(member.tag);
        }

        if category == MANAGED && !report.is_noop() {
            if let Some(tracker) = self.tracker() {
                let scope = selector
                    .members()
                    .await
                    .into_iter()
                    .filter(|t| *t != auto && !is_sentinel(t));
                tracker.set_scope(scope).await;
            }
        }

        info!(
            category,
            removed = report.removed.len(),
            added = report.added.len(),
            unchanged = report.unchanged.len(),
            failed = failures.len(),
            "group reconciled"
        );

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(TunnelError::Reconcile(failures))
        }
    }
}
