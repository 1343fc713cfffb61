//! topic 前缀树。
//!
//! 每个节点对应一个 topic 层级：字面量子节点、`+` 子节点、`#` 终止标记，
//! 以及恰好终止于该节点的规则 ID。解析时字面量优先于 `+`，`#` 命中即收集并终止该分支，
//! 所有匹配分支的结果按发现顺序去重合并。

use crate::error::ResolveError;
use domain::topic::split_topic;
use domain::{MappingRule, TOPIC_WILDCARD_MULTI, TOPIC_WILDCARD_SINGLE};
use mapping_contract::validate_subscription_topic;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct MappingTreeNode {
    children: HashMap<String, MappingTreeNode>,
    single_wildcard: Option<Box<MappingTreeNode>>,
    multi_wildcard_ids: Vec<String>,
    mapping_ids: Vec<String>,
}

impl MappingTreeNode {
    fn insert(&mut self, levels: &[String], mapping_id: &str) {
        let Some((first, rest)) = levels.split_first() else {
            push_unique(&mut self.mapping_ids, mapping_id);
            return;
        };
        if first == TOPIC_WILDCARD_MULTI {
            push_unique(&mut self.multi_wildcard_ids, mapping_id);
        } else if first == TOPIC_WILDCARD_SINGLE {
            self.single_wildcard
                .get_or_insert_with(Default::default)
                .insert(rest, mapping_id);
        } else {
            self.children
                .entry(first.clone())
                .or_default()
                .insert(rest, mapping_id);
        }
    }

    /// 只移除规则 ID，并剪掉因此变空的子节点；祖先与后代上的其他规则不受影响。
    fn remove(&mut self, levels: &[String], mapping_id: &str) -> bool {
        let Some((first, rest)) = levels.split_first() else {
            return remove_id(&mut self.mapping_ids, mapping_id);
        };
        if first == TOPIC_WILDCARD_MULTI {
            return remove_id(&mut self.multi_wildcard_ids, mapping_id);
        }
        if first == TOPIC_WILDCARD_SINGLE {
            let Some(child) = self.single_wildcard.as_mut() else {
                return false;
            };
            let removed = child.remove(rest, mapping_id);
            if child.is_empty() {
                self.single_wildcard = None;
            }
            return removed;
        }
        let Some(child) = self.children.get_mut(first) else {
            return false;
        };
        let removed = child.remove(rest, mapping_id);
        if child.is_empty() {
            self.children.remove(first);
        }
        removed
    }

    fn resolve(&self, levels: &[String], found: &mut Vec<String>, seen: &mut HashSet<String>) {
        let Some((first, rest)) = levels.split_first() else {
            for id in &self.mapping_ids {
                if seen.insert(id.clone()) {
                    found.push(id.clone());
                }
            }
            return;
        };
        if let Some(child) = self.children.get(first) {
            child.resolve(rest, found, seen);
        }
        if let Some(child) = &self.single_wildcard {
            child.resolve(rest, found, seen);
        }
        for id in &self.multi_wildcard_ids {
            if seen.insert(id.clone()) {
                found.push(id.clone());
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.children.is_empty()
            && self.single_wildcard.is_none()
            && self.multi_wildcard_ids.is_empty()
            && self.mapping_ids.is_empty()
    }

    fn node_count(&self) -> usize {
        1 + self.children.values().map(Self::node_count).sum::<usize>()
            + self
                .single_wildcard
                .as_ref()
                .map_or(0, |child| child.node_count())
    }
}

fn push_unique(ids: &mut Vec<String>, mapping_id: &str) {
    if !ids.iter().any(|id| id == mapping_id) {
        ids.push(mapping_id.to_string());
    }
}

fn remove_id(ids: &mut Vec<String>, mapping_id: &str) -> bool {
    let before = ids.len();
    ids.retain(|id| id != mapping_id);
    ids.len() != before
}

/// 入站规则前缀树，连同规则表一起作为不可变快照整体替换。
#[derive(Debug, Clone, Default)]
pub struct MappingTree {
    root: MappingTreeNode,
    rules: HashMap<String, Arc<MappingRule>>,
}

impl MappingTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// 批量构建；任一规则模式非法时整体失败。
    pub fn build<I>(rules: I) -> Result<Self, ResolveError>
    where
        I: IntoIterator<Item = Arc<MappingRule>>,
    {
        let mut tree = Self::new();
        for rule in rules {
            tree.add_mapping(rule)?;
        }
        Ok(tree)
    }

    /// 插入规则；同 ID 规则已存在时先移除旧模式。
    pub fn add_mapping(&mut self, rule: Arc<MappingRule>) -> Result<(), ResolveError> {
        let errors = validate_subscription_topic(&rule.subscription_topic);
        if !errors.is_empty() {
            return Err(ResolveError::Invalid {
                mapping_id: rule.id.clone(),
                errors,
            });
        }
        if let Some(previous) = self.rules.get(&rule.id).cloned() {
            self.root
                .remove(&split_topic(&previous.subscription_topic), &previous.id);
        }
        self.root
            .insert(&split_topic(&rule.subscription_topic), &rule.id);
        self.rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    pub fn delete_mapping(&mut self, mapping_id: &str) -> Option<Arc<MappingRule>> {
        let rule = self.rules.remove(mapping_id)?;
        self.root
            .remove(&split_topic(&rule.subscription_topic), mapping_id);
        Some(rule)
    }

    /// 解析具体 topic 命中的全部规则（发现顺序、按 ID 去重）；无命中返回空列表。
    pub fn resolve(&self, topic: &str) -> Vec<Arc<MappingRule>> {
        self.resolve_ids(topic)
            .into_iter()
            .filter_map(|id| self.rules.get(&id).cloned())
            .collect()
    }

    pub fn resolve_ids(&self, topic: &str) -> Vec<String> {
        let mut found = Vec::new();
        let mut seen = HashSet::new();
        self.root
            .resolve(&split_topic(topic), &mut found, &mut seen);
        found
    }

    pub fn get(&self, mapping_id: &str) -> Option<Arc<MappingRule>> {
        self.rules.get(mapping_id).cloned()
    }

    pub fn rules(&self) -> impl Iterator<Item = &Arc<MappingRule>> {
        self.rules.values()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// 节点总数（含根节点）。
    pub fn node_count(&self) -> usize {
        self.root.node_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{Direction, MappingType, Substitution, TargetApi};
    use serde_json::json;

    fn rule(id: &str, pattern: &str) -> Arc<MappingRule> {
        Arc::new(MappingRule {
            id: id.to_string(),
            name: id.to_string(),
            direction: Direction::Inbound,
            subscription_topic: pattern.to_string(),
            mapping_topic_sample: pattern.replace('+', "x").replace('#', "x"),
            publish_topic: None,
            filter_mapping: None,
            filter_inventory: None,
            target_api: TargetApi::Measurement,
            mapping_type: MappingType::Json,
            target_template: json!({}),
            substitutions: vec![Substitution::new("id", "_IDENTITY_.globalId")],
            map_device_identifier: false,
            external_id_type: String::new(),
            active: true,
            deployed: true,
            debug: false,
        })
    }

    fn ids(tree: &MappingTree, topic: &str) -> Vec<String> {
        tree.resolve_ids(topic)
    }

    #[test]
    fn nested_rules_resolve_independently() {
        let mut tree = MappingTree::new();
        tree.add_mapping(rule("00", "device/test")).expect("00");
        tree.add_mapping(rule("01", "device/test/sub")).expect("01");
        tree.add_mapping(rule("02", "device/test/sub/subsub")).expect("02");

        assert_eq!(ids(&tree, "device/test/sub/subsub"), vec!["02"]);

        tree.delete_mapping("01").expect("delete 01");
        assert_eq!(ids(&tree, "device/test/sub/subsub"), vec!["02"]);
        assert!(ids(&tree, "device/test/sub").is_empty());
        assert_eq!(ids(&tree, "device/test"), vec!["00"]);
    }

    #[test]
    fn adding_twice_does_not_duplicate() {
        let mut tree = MappingTree::new();
        tree.add_mapping(rule("a", "device/+/east")).expect("first");
        tree.add_mapping(rule("a", "device/+/east")).expect("second");
        assert_eq!(ids(&tree, "device/us/east"), vec!["a"]);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn update_moves_rule_to_new_pattern() {
        let mut tree = MappingTree::new();
        tree.add_mapping(rule("a", "device/+/east")).expect("first");
        tree.add_mapping(rule("a", "device/+/west")).expect("update");
        assert!(ids(&tree, "device/us/east").is_empty());
        assert_eq!(ids(&tree, "device/us/west"), vec!["a"]);
    }

    #[test]
    fn literal_then_single_then_multi_wildcard() {
        let mut tree = MappingTree::new();
        tree.add_mapping(rule("multi", "device/#")).expect("multi");
        tree.add_mapping(rule("single", "device/+/east")).expect("single");
        tree.add_mapping(rule("literal", "device/us/east")).expect("literal");

        assert_eq!(
            ids(&tree, "device/us/east"),
            vec!["literal", "single", "multi"]
        );
        assert_eq!(ids(&tree, "device/eu/east"), vec!["single", "multi"]);
        assert_eq!(ids(&tree, "device/eu/west/deep"), vec!["multi"]);
        assert!(ids(&tree, "device").is_empty());
        assert!(ids(&tree, "other/us/east").is_empty());
    }

    #[test]
    fn strict_prefix_does_not_match() {
        let mut tree = MappingTree::new();
        tree.add_mapping(rule("a", "device/+/east")).expect("a");
        assert!(ids(&tree, "device/us").is_empty());
        assert!(ids(&tree, "device/us/east/more").is_empty());
    }

    #[test]
    fn empty_levels_are_literal_levels() {
        let mut tree = MappingTree::new();
        tree.add_mapping(rule("a", "/device/+")).expect("a");
        assert_eq!(ids(&tree, "/device/x"), vec!["a"]);
        assert!(ids(&tree, "device/x").is_empty());
    }

    #[test]
    fn malformed_pattern_is_rejected() {
        let mut tree = MappingTree::new();
        let err = tree
            .add_mapping(rule("bad", "device/#/east"))
            .expect_err("rejected");
        assert!(matches!(err, ResolveError::Invalid { .. }));
        assert!(tree.is_empty());
        assert_eq!(tree.node_count(), 1);
    }

    #[test]
    fn delete_prunes_empty_branches() {
        let mut tree = MappingTree::new();
        tree.add_mapping(rule("a", "device/+/east")).expect("a");
        tree.add_mapping(rule("b", "device/#")).expect("b");
        assert!(tree.node_count() > 1);
        tree.delete_mapping("a").expect("a");
        tree.delete_mapping("b").expect("b");
        assert_eq!(tree.node_count(), 1);
        assert!(tree.delete_mapping("a").is_none());
    }
}
