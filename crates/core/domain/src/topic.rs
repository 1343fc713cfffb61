//! topic 层级工具。

pub const TOPIC_WILDCARD_SINGLE: &str = "+";
pub const TOPIC_WILDCARD_MULTI: &str = "#";
pub const TOPIC_SEPARATOR: char = '/';

/// 按 `/` 切分 topic，保留空层级（`a//b` 有三层）。
pub fn split_topic(topic: &str) -> Vec<String> {
    topic.split(TOPIC_SEPARATOR).map(str::to_string).collect()
}

pub fn join_levels<S: AsRef<str>>(levels: &[S]) -> String {
    levels
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join("/")
}

pub fn is_wildcard(level: &str) -> bool {
    level == TOPIC_WILDCARD_SINGLE || level == TOPIC_WILDCARD_MULTI
}

pub fn contains_wildcard(topic: &str) -> bool {
    topic.split(TOPIC_SEPARATOR).any(|level| {
        level.contains(TOPIC_WILDCARD_SINGLE) || level.contains(TOPIC_WILDCARD_MULTI)
    })
}

/// 具体 topic 是否匹配订阅模式（与前缀树解析语义一致）。
pub fn matches(pattern: &str, topic: &str) -> bool {
    let pattern_levels: Vec<&str> = pattern.split(TOPIC_SEPARATOR).collect();
    let topic_levels: Vec<&str> = topic.split(TOPIC_SEPARATOR).collect();
    for (index, level) in pattern_levels.iter().enumerate() {
        if *level == TOPIC_WILDCARD_MULTI {
            return topic_levels.len() > index;
        }
        match topic_levels.get(index) {
            Some(actual) if *level == TOPIC_WILDCARD_SINGLE || level == actual => {}
            _ => return false,
        }
    }
    pattern_levels.len() == topic_levels.len()
}
