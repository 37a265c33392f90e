//! Keyed-element text format.
//!
//! The store's manifests and branch markers use a small human-readable
//! format of `key = value` attributes. A value of `~` opens a nested
//! element whose children are indented by one extra tab:
//!
//! ```text
//! BasePath = data/models
//! Dependencies = ~
//!     chest.dae = 1698241712
//! ```

use crate::error::{AssetError, Result};

/// One parsed item: either an attribute value or a nested element.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Item {
    Value(String),
    Element(Element),
}

/// An element body: keyed items in document order. Duplicate keys are
/// allowed; lookup helpers return the first match.
pub type Element = Vec<(String, Item)>;

impl Item {
    pub fn as_value(&self) -> Option<&str> {
        match self {
            Item::Value(v) => Some(v),
            Item::Element(_) => None,
        }
    }

    pub fn as_element(&self) -> Option<&Element> {
        match self {
            Item::Value(_) => None,
            Item::Element(e) => Some(e),
        }
    }
}

pub fn find_value<'a>(element: &'a Element, key: &str) -> Option<&'a str> {
    element.iter().find(|(k, _)| k == key).and_then(|(_, item)| item.as_value())
}

pub fn find_element<'a>(element: &'a Element, key: &str) -> Option<&'a Element> {
    element.iter().find(|(k, _)| k == key).and_then(|(_, item)| item.as_element())
}

/// Serializes keyed items, tracking element depth.
#[derive(Debug, Default)]
pub struct KeyedWriter {
    out: String,
    depth: usize,
}

impl KeyedWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&mut self, key: &str, value: &str) {
        self.line(key, value);
    }

    pub fn begin_element(&mut self, key: &str) {
        self.line(key, "~");
        self.depth += 1;
    }

    pub fn end_element(&mut self) {
        debug_assert!(self.depth > 0, "end_element without begin_element");
        self.depth -= 1;
    }

    /// Returns the serialized document. Every `begin_element` must have
    /// been closed.
    pub fn finish(self) -> String {
        debug_assert_eq!(self.depth, 0, "unclosed element in keyed document");
        self.out
    }

    fn line(&mut self, key: &str, value: &str) {
        debug_assert!(!key.contains(['\n', '\r']) && !value.contains(['\n', '\r']));
        for _ in 0..self.depth {
            self.out.push('\t');
        }
        self.out.push_str(key);
        self.out.push_str(" = ");
        self.out.push_str(value);
        self.out.push('\n');
    }
}

/// Writes a whole element tree.
pub fn write_element(writer: &mut KeyedWriter, element: &Element) {
    for (key, item) in element {
        match item {
            Item::Value(v) => writer.value(key, v),
            Item::Element(children) => {
                writer.begin_element(key);
                write_element(writer, children);
                writer.end_element();
            }
        }
    }
}

/// Parses a keyed document into its root element.
pub fn parse(text: &str) -> Result<Element> {
    let lines = text
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(number, line)| {
            let indent = line.bytes().take_while(|&b| b == b'\t').count();
            (number + 1, indent, line[indent..].trim_end())
        })
        .collect::<Vec<_>>();
    let mut pos = 0;
    let root = parse_block(&lines, &mut pos, 0)?;
    if pos != lines.len() {
        let (number, ..) = lines[pos];
        return Err(parse_error(number, "unexpected indentation"));
    }
    Ok(root)
}

fn parse_block(lines: &[(usize, usize, &str)], pos: &mut usize, depth: usize) -> Result<Element> {
    let mut element = Element::new();
    while let Some(&(number, indent, content)) = lines.get(*pos) {
        if indent < depth {
            break;
        }
        if indent > depth {
            return Err(parse_error(number, "unexpected indentation"));
        }
        let (key, value) = content
            .split_once(" = ")
            .ok_or_else(|| parse_error(number, "expected `key = value`"))?;
        *pos += 1;
        if value == "~" {
            let children = parse_block(lines, pos, depth + 1)?;
            element.push((key.to_string(), Item::Element(children)));
        } else {
            element.push((key.to_string(), Item::Value(value.to_string())));
        }
    }
    Ok(element)
}

fn parse_error(line: usize, message: &str) -> AssetError {
    AssetError::msg(format!("keyed document line {line}: {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> Element {
        vec![
            ("BasePath".into(), Item::Value("data/models".into())),
            ("Invalid".into(), Item::Value("0".into())),
            (
                "Dependencies".into(),
                Item::Element(vec![
                    ("chest.dae".into(), Item::Value("1698241712".into())),
                    ("chest.material".into(), Item::Value("doesnotexist".into())),
                ]),
            ),
        ]
    }

    #[test]
    fn round_trips_nested_elements() {
        let mut writer = KeyedWriter::new();
        write_element(&mut writer, &sample());
        let text = writer.finish();
        assert_eq!(parse(&text).unwrap(), sample());
    }

    #[test]
    fn lookup_helpers() {
        let root = sample();
        assert_eq!(find_value(&root, "BasePath"), Some("data/models"));
        let deps = find_element(&root, "Dependencies").unwrap();
        assert_eq!(find_value(deps, "chest.material"), Some("doesnotexist"));
        assert_eq!(find_value(&root, "Dependencies"), None);
    }

    #[test]
    fn rejects_bad_indentation() {
        assert!(parse("\tOrphan = 1\n").is_err());
    }

    #[test]
    fn rejects_missing_separator() {
        assert!(parse("JustAKey\n").is_err());
    }

    #[test]
    fn empty_document_is_empty_element() {
        assert!(parse("").unwrap().is_empty());
    }
}
