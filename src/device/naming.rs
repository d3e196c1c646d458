//! Instance index and display-name derivation

use super::ClassDescriptor;
use std::collections::{BTreeSet, HashMap};

/// Upper bound (exclusive) of the derived device index
pub const INDEX_MODULUS: u32 = 1000;

/// Deterministic index for a base path.
///
/// 32-bit `h * 31 + c` string hash over UTF-16 code units with wrapping
/// arithmetic, absolute value reduced modulo [`INDEX_MODULUS`]. Stable across
/// restarts and platforms.
pub fn device_index(base_path: &str) -> u32 {
    let mut hash: i32 = 0;
    for unit in base_path.encode_utf16() {
        hash = hash.wrapping_mul(31).wrapping_add(i32::from(unit));
    }
    hash.unsigned_abs() % INDEX_MODULUS
}

/// Expand a camelCase / snake_case / kebab-case segment into Title Case words
pub fn title_case(segment: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;

    for c in segment.chars() {
        if c == '_' || c == '-' || c == ' ' {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        current.push(c);
    }
    if !current.is_empty() {
        words.push(current);
    }

    words
        .iter()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Category name of a device: the non-numeric path segments after the
/// class container, title-cased. Falls back to the class label.
pub fn category_name(descriptor: &ClassDescriptor, base_path: &str) -> String {
    let segments: Vec<&str> = base_path.split('.').filter(|s| !s.is_empty()).collect();
    let skip = if segments
        .iter()
        .zip(descriptor.container.iter())
        .all(|(a, b)| a == b)
    {
        descriptor.container.len().min(segments.len())
    } else {
        0
    };

    let words: Vec<String> = segments[skip..]
        .iter()
        .filter(|s| !s.chars().all(|c| c.is_ascii_digit()))
        .map(|s| title_case(s))
        .collect();

    if words.is_empty() {
        descriptor.category_label.to_string()
    } else {
        words.join(" ")
    }
}

/// Hands out display names, disambiguating repeats within one class.
///
/// The first device of a category gets the bare name, later ones get
/// ` 2`, ` 3`, ... appended. A released name is handed out again.
#[derive(Debug, Default)]
pub struct NameAllocator {
    used: HashMap<String, BTreeSet<u32>>,
}

impl NameAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, category: &str) -> String {
        let taken = self.used.entry(category.to_string()).or_default();
        let n = (1..).find(|n| !taken.contains(n)).unwrap_or(1);
        taken.insert(n);
        if n == 1 {
            category.to_string()
        } else {
            format!("{} {}", category, n)
        }
    }

    /// Return a name obtained from [`Self::allocate`]
    pub fn release(&mut self, category: &str, name: &str) {
        let n = if name == category {
            1
        } else {
            match name
                .strip_prefix(category)
                .and_then(|rest| rest.strip_prefix(' '))
                .and_then(|n| n.parse::<u32>().ok())
            {
                Some(n) => n,
                None => return,
            }
        };
        if let Some(taken) = self.used.get_mut(category) {
            taken.remove(&n);
        }
    }

    pub fn clear(&mut self) {
        self.used.clear();
    }
}
