//! 过滤规则：排除模式、对象年龄

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("无效的排除模式 `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("无效的时长 `{0}`，示例: 7d10h31s")]
    Duration(String),
}

/// 排除规则
///
/// `*` 匹配任意字符序列（包括 `/`），`?` 匹配单个字符，区分大小写，
/// 对完整的相对 key 做匹配。
#[derive(Debug, Clone, Default)]
pub struct ExcludeFilter {
    patterns: Vec<Regex>,
}

impl ExcludeFilter {
    pub fn new(patterns: &[String]) -> Result<Self, FilterError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(&wildcard_to_regex(p)).map_err(|source| FilterError::Pattern {
                    pattern: p.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// 检查路径是否应该被排除
    pub fn is_excluded(&self, key: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(key))
    }
}

fn wildcard_to_regex(pattern: &str) -> String {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4]))),
        }
    }
    re.push('$');
    re
}

/// 解析 `7d10h31s` 形式的时长，支持 d/h/m/s/ms
pub fn parse_duration(input: &str) -> Result<Duration, FilterError> {
    let err = || FilterError::Duration(input.to_string());
    let input = input.trim();
    if input.is_empty() {
        return Err(err());
    }

    let mut total = Duration::zero();
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(err());
        }
        let value: i64 = rest[..digits].parse().map_err(|_| err())?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "d" => Duration::days(value),
            "h" => Duration::hours(value),
            "m" => Duration::minutes(value),
            "s" => Duration::seconds(value),
            "ms" => Duration::milliseconds(value),
            _ => return Err(err()),
        };
        total += part;
        rest = &rest[unit_len..];
    }
    Ok(total)
}

/// 按对象年龄过滤
#[derive(Debug, Clone, Copy, Default)]
pub struct AgeFilter {
    /// 只保留比该时长更旧的对象
    pub older_than: Option<Duration>,
    /// 只保留比该时长更新的对象
    pub newer_than: Option<Duration>,
}

impl AgeFilter {
    pub fn parse(older_than: Option<&str>, newer_than: Option<&str>) -> Result<Self, FilterError> {
        Ok(Self {
            older_than: older_than.map(parse_duration).transpose()?,
            newer_than: newer_than.map(parse_duration).transpose()?,
        })
    }

    pub fn should_skip(&self, time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let age = now - time;
        if let Some(older) = self.older_than {
            if age < older {
                return true;
            }
        }
        if let Some(newer) = self.newer_than {
            if age >= newer {
                return true;
            }
        }
        false
    }
}
