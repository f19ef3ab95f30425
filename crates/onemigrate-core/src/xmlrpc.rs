//! Minimal XML-RPC encoding and decoding.
//!
//! Covers the value types OpenNebula's API uses: integers, booleans,
//! strings, doubles, arrays and structs (the latter only appear in faults).

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::{Error, Result};

/// An XML-RPC value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Str(String),
    Double(f64),
    Array(Vec<Value>),
    Struct(Vec<(String, Value)>),
    Nil,
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Look up a struct member by name.
    pub fn member(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Struct(members) => members.iter().find(|(n, _)| n == name).map(|(_, v)| v),
            _ => None,
        }
    }
}

/// A decoded `methodResponse`.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Successful call with its return values.
    Params(Vec<Value>),
    /// Server-side fault.
    Fault { code: i64, message: String },
}

/// Encode a `methodCall` document.
pub fn encode_call(method: &str, params: &[Value]) -> Result<String> {
    let mut writer = Writer::new(Vec::new());

    write(&mut writer, Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    open(&mut writer, "methodCall")?;
    text_element(&mut writer, "methodName", method)?;
    open(&mut writer, "params")?;
    for param in params {
        open(&mut writer, "param")?;
        write_value(&mut writer, param)?;
        close(&mut writer, "param")?;
    }
    close(&mut writer, "params")?;
    close(&mut writer, "methodCall")?;

    String::from_utf8(writer.into_inner()).map_err(|e| Error::xml_rpc(e.to_string()))
}

fn write_value(writer: &mut Writer<Vec<u8>>, value: &Value) -> Result<()> {
    open(writer, "value")?;
    match value {
        Value::Int(i) => text_element(writer, "i4", &i.to_string())?,
        Value::Bool(b) => text_element(writer, "boolean", if *b { "1" } else { "0" })?,
        Value::Str(s) => text_element(writer, "string", s)?,
        Value::Double(d) => text_element(writer, "double", &d.to_string())?,
        Value::Nil => write(writer, Event::Empty(BytesStart::new("nil")))?,
        Value::Array(items) => {
            open(writer, "array")?;
            open(writer, "data")?;
            for item in items {
                write_value(writer, item)?;
            }
            close(writer, "data")?;
            close(writer, "array")?;
        }
        Value::Struct(members) => {
            open(writer, "struct")?;
            for (name, member) in members {
                open(writer, "member")?;
                text_element(writer, "name", name)?;
                write_value(writer, member)?;
                close(writer, "member")?;
            }
            close(writer, "struct")?;
        }
    }
    close(writer, "value")
}

fn write(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<()> {
    writer
        .write_event(event)
        .map_err(|e| Error::xml_rpc(format!("failed to encode call: {}", e)))
}

fn open(writer: &mut Writer<Vec<u8>>, name: &str) -> Result<()> {
    write(writer, Event::Start(BytesStart::new(name)))
}

fn close(writer: &mut Writer<Vec<u8>>, name: &str) -> Result<()> {
    write(writer, Event::End(BytesEnd::new(name)))
}

fn text_element(writer: &mut Writer<Vec<u8>>, name: &str, text: &str) -> Result<()> {
    open(writer, name)?;
    write(writer, Event::Text(BytesText::new(text)))?;
    close(writer, name)
}

/// An element with its children and concatenated text content.
#[derive(Debug, Default)]
struct Node {
    name: String,
    text: String,
    children: Vec<Node>,
}

impl Node {
    fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    fn require(&self, name: &str) -> Result<&Node> {
        self.child(name)
            .ok_or_else(|| Error::xml_rpc(format!("<{}> is missing <{}>", self.name, name)))
    }
}

/// Decode a `methodResponse` document.
pub fn decode_response(xml: &str) -> Result<Response> {
    let root = parse_tree(xml)?;
    if root.name != "methodResponse" {
        return Err(Error::xml_rpc(format!(
            "expected <methodResponse>, found <{}>",
            root.name
        )));
    }

    if let Some(fault) = root.child("fault") {
        let value = decode_value(fault.require("value")?)?;
        let code = value.member("faultCode").and_then(Value::as_i64).unwrap_or(0);
        let message = value
            .member("faultString")
            .and_then(Value::as_str)
            .unwrap_or("unknown fault")
            .to_string();
        return Ok(Response::Fault { code, message });
    }

    let params = root.require("params")?;
    let values = params
        .children_named("param")
        .map(|param| decode_value(param.require("value")?))
        .collect::<Result<Vec<_>>>()?;
    Ok(Response::Params(values))
}

fn decode_value(node: &Node) -> Result<Value> {
    let Some(typed) = node.children.first() else {
        // A <value> without a type element is a string.
        return Ok(Value::Str(node.text.clone()));
    };

    let text = typed.text.trim();
    match typed.name.as_str() {
        "i4" | "int" | "i8" => text
            .parse()
            .map(Value::Int)
            .map_err(|_| Error::xml_rpc(format!("invalid integer '{}'", text))),
        "boolean" => match text {
            "1" => Ok(Value::Bool(true)),
            "0" => Ok(Value::Bool(false)),
            other => Err(Error::xml_rpc(format!("invalid boolean '{}'", other))),
        },
        "double" => text
            .parse()
            .map(Value::Double)
            .map_err(|_| Error::xml_rpc(format!("invalid double '{}'", text))),
        "string" => Ok(Value::Str(typed.text.clone())),
        "nil" => Ok(Value::Nil),
        "array" => typed
            .require("data")?
            .children_named("value")
            .map(decode_value)
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        "struct" => typed
            .children_named("member")
            .map(|member| {
                let name = member.require("name")?.text.trim().to_string();
                let value = decode_value(member.require("value")?)?;
                Ok((name, value))
            })
            .collect::<Result<Vec<_>>>()
            .map(Value::Struct),
        other => Err(Error::xml_rpc(format!("unsupported value type <{}>", other))),
    }
}

fn parse_tree(xml: &str) -> Result<Node> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<Node> = vec![Node::default()];

    loop {
        let event = reader
            .read_event()
            .map_err(|e| Error::xml_rpc(format!("malformed response: {}", e)))?;
        match event {
            Event::Start(start) => stack.push(Node {
                name: element_name(&start),
                ..Node::default()
            }),
            Event::Empty(start) => {
                let node = Node {
                    name: element_name(&start),
                    ..Node::default()
                };
                push_child(&mut stack, node)?;
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| Error::xml_rpc("unbalanced closing tag"))?;
                push_child(&mut stack, node)?;
            }
            Event::Text(text) => {
                let text = text
                    .unescape()
                    .map_err(|e| Error::xml_rpc(format!("bad text content: {}", e)))?;
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&text);
                }
            }
            Event::CData(data) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let mut document = stack
        .pop()
        .filter(|_| stack.is_empty())
        .ok_or_else(|| Error::xml_rpc("unexpected end of document"))?;
    document
        .children
        .pop()
        .ok_or_else(|| Error::xml_rpc("empty document"))
}

fn push_child(stack: &mut [Node], node: Node) -> Result<()> {
    let parent = stack
        .last_mut()
        .ok_or_else(|| Error::xml_rpc("unbalanced closing tag"))?;
    parent.children.push(node);
    Ok(())
}

fn element_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.local_name().as_ref()).into_owned()
}
