//! 类名排除列表
//!
//! 模式以 `,` 或 `;` 分隔。匹配规则：
//! - `.` 和 `/` 视为同一个分隔符
//! - 遇到 `*` 立即判定匹配成功，不再看模式剩余部分（`com/*Foo` 等价于 `com/*`）
//! - 否则要求逐字符相同且同时结束
//!
//! 注意 `*` 的行为比常规 glob 宽松：出现在模式中间时后面的字符全部被忽略。

/// 排除列表
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExcludeList {
    patterns: Vec<String>,
}

impl ExcludeList {
    /// 解析 `a/b/*;c.d.E,...`
    pub fn parse(list: &str) -> Self {
        let patterns = list
            .split([',', ';'])
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// 任一模式匹配即排除
    pub fn matches(&self, class_name: &str) -> bool {
        self.patterns.iter().any(|p| wildcard_match(p, class_name))
    }
}

fn is_separator(c: u8) -> bool {
    c == b'.' || c == b'/'
}

/// 单个模式匹配
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let pattern = pattern.as_bytes();
    let name = name.as_bytes();
    let mut i = 0;
    loop {
        match (pattern.get(i), name.get(i)) {
            (Some(b'*'), _) => return true,
            (None, None) => return true,
            (Some(&p), Some(&n)) => {
                if p != n && !(is_separator(p) && is_separator(n)) {
                    return false;
                }
            }
            _ => return false,
        }
        i += 1;
    }
}
