use std::borrow::Cow;
use std::fmt::Write;

use crate::types::Byte;

#[macro_export]
macro_rules! dbgprop_header {
    ($name:expr) => {
        DebuggableProperty::new($name, DebuggablePropertyValue::Header)
    };
}

#[macro_export]
macro_rules! dbgprop_bool {
    ($name:expr, $val:expr) => {
        DebuggableProperty::new($name, DebuggablePropertyValue::Boolean($val))
    };
}

#[macro_export]
macro_rules! dbgprop_byte {
    ($name:expr, $val:expr) => {
        DebuggableProperty::new($name, DebuggablePropertyValue::Byte($val))
    };
}

#[macro_export]
macro_rules! dbgprop_byte_bin {
    ($name:expr, $val:expr) => {
        DebuggableProperty::new($name, DebuggablePropertyValue::ByteBinary($val))
    };
}

#[macro_export]
macro_rules! dbgprop_udec {
    ($name:expr, $val:expr) => {
        DebuggableProperty::new(
            $name,
            DebuggablePropertyValue::UnsignedDecimal(u64::try_from($val).unwrap_or(u64::MAX)),
        )
    };
}

#[macro_export]
macro_rules! dbgprop_enum {
    ($name:expr, $val:expr) => {
        DebuggableProperty::new(
            $name,
            DebuggablePropertyValue::StaticStr($val.clone().into()),
        )
    };
}

#[macro_export]
macro_rules! dbgprop_string {
    ($name:expr, $val:expr) => {
        DebuggableProperty::new($name, DebuggablePropertyValue::String($val))
    };
}

#[macro_export]
macro_rules! dbgprop_str {
    ($name:expr, $val:expr) => {
        DebuggableProperty::new($name, DebuggablePropertyValue::StaticStr($val))
    };
}

#[macro_export]
macro_rules! dbgprop_nest {
    ($name:expr, $val:expr) => {
        DebuggableProperty::new(
            $name,
            DebuggablePropertyValue::Nested($val.get_debug_properties()),
        )
    };
}

#[macro_export]
macro_rules! dbgprop_group {
    ($name:expr, $val:expr) => {
        DebuggableProperty::new($name, DebuggablePropertyValue::Nested($val))
    };
}

pub type DebuggableProperties = Vec<DebuggableProperty>;

pub struct DebuggableProperty {
    name: Cow<'static, str>,
    value: DebuggablePropertyValue,
}

impl DebuggableProperty {
    pub fn new(name: impl Into<Cow<'static, str>>, value: DebuggablePropertyValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &DebuggablePropertyValue {
        &self.value
    }
}

pub enum DebuggablePropertyValue {
    Header,
    Nested(DebuggableProperties),
    Boolean(bool),
    Byte(Byte),
    ByteBinary(Byte),
    UnsignedDecimal(u64),
    StaticStr(&'static str),
    String(String),
}

pub trait Debuggable {
    fn get_debug_properties(&self) -> DebuggableProperties;
}

/// Renders a property tree as indented text, for log output
pub fn render(props: &[DebuggableProperty]) -> String {
    fn walk(out: &mut String, props: &[DebuggableProperty], depth: usize) {
        for p in props {
            let indent = depth * 2;
            let _ = match p.value() {
                DebuggablePropertyValue::Header => writeln!(out, "{:indent$}[{}]", "", p.name()),
                DebuggablePropertyValue::Nested(children) => {
                    let _ = writeln!(out, "{:indent$}{}:", "", p.name());
                    walk(out, children, depth + 1);
                    Ok(())
                }
                DebuggablePropertyValue::Boolean(v) => {
                    writeln!(out, "{:indent$}{}: {}", "", p.name(), v)
                }
                DebuggablePropertyValue::Byte(v) => {
                    writeln!(out, "{:indent$}{}: ${:02X}", "", p.name(), v)
                }
                DebuggablePropertyValue::ByteBinary(v) => {
                    writeln!(out, "{:indent$}{}: {:08b}", "", p.name(), v)
                }
                DebuggablePropertyValue::UnsignedDecimal(v) => {
                    writeln!(out, "{:indent$}{}: {}", "", p.name(), v)
                }
                DebuggablePropertyValue::StaticStr(v) => {
                    writeln!(out, "{:indent$}{}: {}", "", p.name(), v)
                }
                DebuggablePropertyValue::String(v) => {
                    writeln!(out, "{:indent$}{}: {}", "", p.name(), v)
                }
            };
        }
    }

    let mut out = String::new();
    walk(&mut out, props, 0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_tree() {
        let props = vec![
            dbgprop_header!("Queues"),
            dbgprop_group!(
                "Issue",
                vec![dbgprop_byte!("Status", 0x02), dbgprop_bool!("Sent", true)]
            ),
            dbgprop_udec!("Commands", 3usize),
        ];
        assert_eq!(
            render(&props),
            "[Queues]\nIssue:\n  Status: $02\n  Sent: true\nCommands: 3\n"
        );
    }
}
