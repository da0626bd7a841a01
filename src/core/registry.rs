use crate::domain::model::{Oid, SearchRange, Value, VarBind};
use crate::domain::ports::{Directive, MibModule};
use std::sync::Arc;

/// Registered MIB modules, kept sorted by subtree.
#[derive(Default, Clone)]
pub struct MibRegistry {
    modules: Vec<Arc<dyn MibModule>>,
}

impl MibRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: Arc<dyn MibModule>) {
        tracing::debug!(
            target: "main",
            "registering MIB module {} at {}",
            module.name(),
            module.subtree()
        );
        let pos = self
            .modules
            .partition_point(|m| m.subtree() <= module.subtree());
        self.modules.insert(pos, module);
    }

    pub fn modules(&self) -> &[Arc<dyn MibModule>] {
        &self.modules
    }

    pub fn subtrees(&self) -> Vec<Oid> {
        self.modules.iter().map(|m| m.subtree().clone()).collect()
    }

    pub fn directives(&self) -> Vec<Directive> {
        self.modules.iter().flat_map(|m| m.directives()).collect()
    }

    pub async fn get(&self, oid: &Oid) -> Value {
        match self.modules.iter().find(|m| oid.starts_with(m.subtree())) {
            Some(module) => module.get(oid).await,
            None => Value::NoSuchObject,
        }
    }

    /// Finds the first instance inside `range`, or `EndOfMibView` named after
    /// the range start.
    pub async fn get_next(&self, range: &SearchRange) -> VarBind {
        for module in &self.modules {
            let subtree = module.subtree();
            let found = if range.start.starts_with(subtree) {
                module.get_next(&range.start, range.include).await
            } else if range.start < *subtree {
                module.get_next(subtree, true).await
            } else {
                continue;
            };

            if let Some(varbind) = found {
                if range.contains(&varbind.oid) {
                    return varbind;
                }
                // Modules are sorted, so nothing later can fall back inside the range.
                break;
            }
        }
        VarBind::new(range.start.clone(), Value::EndOfMibView)
    }

    /// GetBulk over `ranges`: the first `non_repeaters` ranges get one
    /// GetNext each, the rest are walked up to `max_repetitions` times.
    pub async fn get_bulk(
        &self,
        ranges: &[SearchRange],
        non_repeaters: usize,
        max_repetitions: usize,
    ) -> Vec<VarBind> {
        self.get_bulk_within(ranges, non_repeaters, max_repetitions, |_| true)
            .await
    }

    /// Same as [`get_bulk`](Self::get_bulk), but stops as soon as `accept`
    /// refuses a varbind. The refused varbind is not returned.
    pub async fn get_bulk_within(
        &self,
        ranges: &[SearchRange],
        non_repeaters: usize,
        max_repetitions: usize,
        mut accept: impl FnMut(&VarBind) -> bool + Send,
    ) -> Vec<VarBind> {
        let split = non_repeaters.min(ranges.len());
        let (singles, repeaters) = ranges.split_at(split);

        let mut out = Vec::new();
        for range in singles {
            let varbind = self.get_next(range).await;
            if !accept(&varbind) {
                return out;
            }
            out.push(varbind);
        }

        let mut cursors: Vec<Option<SearchRange>> =
            repeaters.iter().cloned().map(Some).collect();
        for _ in 0..max_repetitions {
            if cursors.is_empty() || cursors.iter().all(Option::is_none) {
                break;
            }
            for (cursor, original) in cursors.iter_mut().zip(repeaters) {
                let varbind = match cursor.take() {
                    Some(range) => {
                        let varbind = self.get_next(&range).await;
                        if varbind.value != Value::EndOfMibView {
                            *cursor = Some(SearchRange {
                                start: varbind.oid.clone(),
                                include: false,
                                end: original.end.clone(),
                            });
                        }
                        varbind
                    }
                    None => VarBind::new(original.start.clone(), Value::EndOfMibView),
                };
                if !accept(&varbind) {
                    return out;
                }
                out.push(varbind);
            }
        }
        out
    }

    pub async fn shutdown(&self) {
        for module in &self.modules {
            module.shutdown().await;
        }
    }
}
