//! XML-RPC envelope encoding and decoding
//!
//! Decoding goes through `roxmltree`; encoding writes escaped XML directly.
//! Nothing in here knows about CCU methods.

use super::value::Value;
use crate::error::MalformedPayload;
use base64::Engine;
use roxmltree::{Document, Node};
use std::collections::BTreeMap;
use std::fmt::Write;
use thiserror::Error;

const XML_HEADER: &str = "<?xml version=\"1.0\"?>\n";

/// A decoded `<methodCall>`
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub method: String,
    pub params: Vec<Value>,
}

impl MethodCall {
    pub fn new<S: Into<String>>(method: S, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// An XML-RPC fault
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("fault {code}: {message}")]
pub struct Fault {
    pub code: i32,
    pub message: String,
}

impl Fault {
    pub fn new<S: Into<String>>(code: i32, message: S) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Fault in the struct shape used inside `system.multicall` results
    pub fn to_value(&self) -> Value {
        let mut members = BTreeMap::new();
        members.insert("faultCode".to_string(), Value::Int(self.code));
        members.insert("faultString".to_string(), Value::String(self.message.clone()));
        Value::Struct(members)
    }
}

/// Outcome of decoding a `<methodResponse>` that did not succeed
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResponseError {
    #[error(transparent)]
    Fault(#[from] Fault),
    #[error(transparent)]
    Malformed(#[from] MalformedPayload),
}

/// Encode a `<methodCall>`
pub fn encode_call(method: &str, params: &[Value]) -> String {
    let mut out = String::from(XML_HEADER);
    out.push_str("<methodCall><methodName>");
    escape_into(&mut out, method);
    out.push_str("</methodName><params>");
    for param in params {
        out.push_str("<param>");
        write_value(&mut out, param);
        out.push_str("</param>");
    }
    out.push_str("</params></methodCall>\n");
    out
}

/// Encode a successful `<methodResponse>`
pub fn encode_response(value: &Value) -> String {
    let mut out = String::from(XML_HEADER);
    out.push_str("<methodResponse><params><param>");
    write_value(&mut out, value);
    out.push_str("</param></params></methodResponse>\n");
    out
}

/// Encode a fault `<methodResponse>`
pub fn encode_fault(code: i32, message: &str) -> String {
    let mut out = String::from(XML_HEADER);
    out.push_str("<methodResponse><fault>");
    write_value(&mut out, &Fault::new(code, message).to_value());
    out.push_str("</fault></methodResponse>\n");
    out
}

/// Decode a `<methodCall>` body
pub fn decode_call(body: &[u8]) -> Result<MethodCall, MalformedPayload> {
    let text = body_to_text(body);
    let doc = parse(&text)?;
    let root = doc.root_element();
    if root.tag_name().name() != "methodCall" {
        return Err(MalformedPayload::new(format!(
            "expected <methodCall>, found <{}>",
            root.tag_name().name()
        )));
    }

    let method = child_element(root, "methodName")
        .map(text_content)
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| MalformedPayload::new("missing <methodName>"))?;

    let params = match child_element(root, "params") {
        Some(params) => decode_params(params)?,
        None => Vec::new(),
    };

    Ok(MethodCall { method, params })
}

/// Decode a `<methodResponse>` body into its value or fault
pub fn decode_response(body: &[u8]) -> Result<Value, ResponseError> {
    let text = body_to_text(body);
    let doc = parse(&text)?;
    let root = doc.root_element();
    if root.tag_name().name() != "methodResponse" {
        return Err(MalformedPayload::new(format!(
            "expected <methodResponse>, found <{}>",
            root.tag_name().name()
        ))
        .into());
    }

    if let Some(fault) = child_element(root, "fault") {
        let value = child_element(fault, "value")
            .ok_or_else(|| MalformedPayload::new("<fault> without <value>"))
            .and_then(decode_value)?;
        let members = value
            .as_struct()
            .ok_or_else(|| MalformedPayload::new("fault value is not a struct"))?;
        let code = members
            .get("faultCode")
            .and_then(Value::as_i32)
            .unwrap_or_default();
        let message = members
            .get("faultString")
            .and_then(Value::as_str)
            .unwrap_or_default();
        return Err(Fault::new(code, message).into());
    }

    let params = child_element(root, "params")
        .ok_or_else(|| MalformedPayload::new("response without <params> or <fault>"))?;
    let mut values = decode_params(params)?;
    if values.is_empty() {
        return Ok(Value::empty());
    }
    if values.len() != 1 {
        return Err(MalformedPayload::new(format!(
            "response must carry exactly one param, found {}",
            values.len()
        ))
        .into());
    }
    Ok(values.remove(0))
}

/// The CCU declares iso-8859-1 for some interfaces; fall back to a
/// byte-per-char decode when the body is not valid UTF-8.
fn body_to_text(body: &[u8]) -> String {
    match std::str::from_utf8(body) {
        Ok(text) => text.to_string(),
        Err(_) => body.iter().map(|&b| b as char).collect(),
    }
}

fn parse(text: &str) -> Result<Document<'_>, MalformedPayload> {
    Document::parse(text).map_err(|e| MalformedPayload::new(format!("invalid XML: {e}")))
}

fn decode_params(params: Node<'_, '_>) -> Result<Vec<Value>, MalformedPayload> {
    elements(params)
        .map(|param| {
            if param.tag_name().name() != "param" {
                return Err(MalformedPayload::new(format!(
                    "unexpected <{}> inside <params>",
                    param.tag_name().name()
                )));
            }
            let value = child_element(param, "value")
                .ok_or_else(|| MalformedPayload::new("<param> without <value>"))?;
            decode_value(value)
        })
        .collect()
}

fn decode_value(node: Node<'_, '_>) -> Result<Value, MalformedPayload> {
    let Some(typed) = elements(node).next() else {
        // untyped <value>text</value> is a string
        return Ok(Value::String(text_content(node)));
    };

    let raw = text_content(typed);
    match typed.tag_name().name() {
        "i4" | "int" => raw
            .trim()
            .parse()
            .map(Value::Int)
            .map_err(|_| MalformedPayload::new(format!("invalid integer '{raw}'"))),
        "boolean" => match raw.trim() {
            "1" | "true" => Ok(Value::Boolean(true)),
            "0" | "false" => Ok(Value::Boolean(false)),
            other => Err(MalformedPayload::new(format!("invalid boolean '{other}'"))),
        },
        "double" => raw
            .trim()
            .parse()
            .map(Value::Double)
            .map_err(|_| MalformedPayload::new(format!("invalid double '{raw}'"))),
        "string" => Ok(Value::String(raw)),
        "dateTime.iso8601" => Ok(Value::DateTime(raw.trim().to_string())),
        "base64" => {
            let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
            base64::engine::general_purpose::STANDARD
                .decode(compact)
                .map(Value::Base64)
                .map_err(|e| MalformedPayload::new(format!("invalid base64: {e}")))
        }
        "nil" => Ok(Value::Nil),
        "array" => {
            let data = child_element(typed, "data")
                .ok_or_else(|| MalformedPayload::new("<array> without <data>"))?;
            elements(data)
                .map(decode_value)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array)
        }
        "struct" => {
            let mut members = BTreeMap::new();
            for member in elements(typed) {
                let name = child_element(member, "name")
                    .map(text_content)
                    .ok_or_else(|| MalformedPayload::new("struct member without <name>"))?;
                let value = child_element(member, "value")
                    .ok_or_else(|| MalformedPayload::new("struct member without <value>"))?;
                members.insert(name, decode_value(value)?);
            }
            Ok(Value::Struct(members))
        }
        other => Err(MalformedPayload::new(format!("unknown value type <{other}>"))),
    }
}

fn elements<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(Node::is_element)
}

fn child_element<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    elements(node).find(|child| child.tag_name().name() == name)
}

fn text_content(node: Node<'_, '_>) -> String {
    node.children()
        .filter(Node::is_text)
        .filter_map(|child| child.text())
        .collect()
}

fn write_value(out: &mut String, value: &Value) {
    out.push_str("<value>");
    match value {
        Value::Boolean(b) => {
            let _ = write!(out, "<boolean>{}</boolean>", u8::from(*b));
        }
        Value::Int(i) => {
            let _ = write!(out, "<i4>{i}</i4>");
        }
        Value::Double(d) => {
            let _ = write!(out, "<double>{d}</double>");
        }
        Value::String(s) => {
            out.push_str("<string>");
            escape_into(out, s);
            out.push_str("</string>");
        }
        Value::DateTime(s) => {
            out.push_str("<dateTime.iso8601>");
            escape_into(out, s);
            out.push_str("</dateTime.iso8601>");
        }
        Value::Base64(bytes) => {
            out.push_str("<base64>");
            out.push_str(&base64::engine::general_purpose::STANDARD.encode(bytes));
            out.push_str("</base64>");
        }
        Value::Nil => out.push_str("<nil/>"),
        Value::Array(items) => {
            out.push_str("<array><data>");
            for item in items {
                write_value(out, item);
            }
            out.push_str("</data></array>");
        }
        Value::Struct(members) => {
            out.push_str("<struct>");
            for (name, member) in members {
                out.push_str("<member><name>");
                escape_into(out, name);
                out.push_str("</name>");
                write_value(out, member);
                out.push_str("</member>");
            }
            out.push_str("</struct>");
        }
    }
    out.push_str("</value>");
}

fn escape_into(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
}
