//! Graph description parser using winnow.
//!
//! Parses GStreamer-like descriptions:
//!
//! ```text
//! packetsrc name=src ! application/x-rtp,media=(string)video ! appsink name=out
//! packetsrc name=rtcp-in ! feedbacksink name=fb ; packetsrc name=media ! appsink
//! ```
//!
//! # Syntax
//!
//! - Elements are separated by `!`, independent chains by `;`
//! - Properties are specified as `name=value` after the element name
//! - Values can be quoted strings, numbers, booleans, or bare words
//! - A bare media type (`type/subtype,field=value,...`) stands for a
//!   `capsfilter` with those caps

use crate::engine::{PropertyType, PropertyValue};
use crate::error::{Error, Result};
use winnow::Parser;
use winnow::ascii::{alpha1, digit1, multispace0};
use winnow::combinator::{alt, delimited, opt, repeat, separated};
use winnow::error::ContextError;
use winnow::token::{take_till, take_while};

type WResult<T> = std::result::Result<T, ContextError>;

/// Factory name used for inline caps.
pub const CAPSFILTER: &str = "capsfilter";

/// A parsed element with its factory name and properties.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedElement {
    /// The element factory name (e.g., "packetsrc", "appsink").
    pub factory: String,
    /// Properties as key-value pairs, in description order.
    pub properties: Vec<(String, ParsedValue)>,
}

impl ParsedElement {
    /// The `name` property, if given.
    pub fn name(&self) -> Option<&str> {
        self.properties.iter().find_map(|(k, v)| match (k.as_str(), v) {
            ("name", ParsedValue::String(s)) => Some(s.as_str()),
            _ => None,
        })
    }
}

/// A literal property value in a description.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedValue {
    /// A string value (quoted or unquoted).
    String(String),
    /// An integer value.
    Integer(i64),
    /// A floating-point value.
    Float(f64),
    /// A boolean value.
    Bool(bool),
}

impl ParsedValue {
    /// Get as a string, converting if necessary.
    pub fn as_string(&self) -> String {
        match self {
            ParsedValue::String(s) => s.clone(),
            ParsedValue::Integer(i) => i.to_string(),
            ParsedValue::Float(f) => f.to_string(),
            ParsedValue::Bool(b) => b.to_string(),
        }
    }

    /// Convert to a value of the registered property type.
    ///
    /// Descriptions are text, so literals are converted to whatever the
    /// element declares. Opaque properties cannot be set from text.
    pub fn to_property(&self, ty: PropertyType) -> Option<PropertyValue> {
        match (ty, self) {
            (PropertyType::String, v) => Some(PropertyValue::String(v.as_string())),
            (PropertyType::Int64, ParsedValue::Integer(i)) => Some(PropertyValue::Int64(*i)),
            (PropertyType::Int64, ParsedValue::String(s)) => {
                s.parse().ok().map(PropertyValue::Int64)
            }
            (PropertyType::Double, ParsedValue::Float(f)) => Some(PropertyValue::Double(*f)),
            (PropertyType::Double, ParsedValue::Integer(i)) => {
                Some(PropertyValue::Double(*i as f64))
            }
            (PropertyType::Bool, ParsedValue::Bool(b)) => Some(PropertyValue::Bool(*b)),
            (PropertyType::Bool, ParsedValue::Integer(i)) => Some(PropertyValue::Bool(*i != 0)),
            _ => None,
        }
    }
}

/// A parsed description: one or more independent chains.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedGraph {
    /// Chains, each in order from source to sink.
    pub chains: Vec<Vec<ParsedElement>>,
}

impl ParsedGraph {
    /// All elements across chains.
    pub fn elements(&self) -> impl Iterator<Item = &ParsedElement> {
        self.chains.iter().flatten()
    }
}

/// Parse a graph description string.
///
/// ```rust
/// use graphbridge::engine::parser::parse_description;
///
/// let graph = parse_description("packetsrc name=src ! identity ! appsink").unwrap();
/// assert_eq!(graph.chains.len(), 1);
/// assert_eq!(graph.chains[0][0].factory, "packetsrc");
/// ```
pub fn parse_description(input: &str) -> Result<ParsedGraph> {
    graph
        .parse(input.trim())
        .map_err(|e| Error::InvalidDescription(format!("parse error: {e}")))
}

fn graph(input: &mut &str) -> WResult<ParsedGraph> {
    let chains = separated(1.., chain, chain_separator).parse_next(input)?;

    multispace0.parse_next(input)?;
    if !input.is_empty() {
        return Err(ContextError::new());
    }

    Ok(ParsedGraph { chains })
}

fn chain(input: &mut &str) -> WResult<Vec<ParsedElement>> {
    separated(1.., element, link_separator).parse_next(input)
}

fn element(input: &mut &str) -> WResult<ParsedElement> {
    let _ = multispace0.parse_next(input)?;
    alt((inline_caps, factory_element)).parse_next(input)
}

fn factory_element(input: &mut &str) -> WResult<ParsedElement> {
    let factory: &str = identifier.parse_next(input)?;
    let _ = multispace0.parse_next(input)?;

    let properties: Vec<(String, ParsedValue)> = repeat(0.., property).parse_next(input)?;

    Ok(ParsedElement {
        factory: factory.to_string(),
        properties,
    })
}

/// `type/subtype[,field=value...]` up to the next `!` or `;`.
fn inline_caps(input: &mut &str) -> WResult<ParsedElement> {
    let caps: &str = (
        media_token,
        '/',
        media_token,
        take_till(0.., |c: char| c == '!' || c == ';'),
    )
        .take()
        .parse_next(input)?;

    Ok(ParsedElement {
        factory: CAPSFILTER.to_string(),
        properties: vec![(
            "caps".to_string(),
            ParsedValue::String(caps.trim_end().to_string()),
        )],
    })
}

fn media_token<'a>(input: &mut &'a str) -> WResult<&'a str> {
    take_while(1.., |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '+' | '.' | '_')
    })
    .parse_next(input)
}

fn link_separator(input: &mut &str) -> WResult<()> {
    let _ = multispace0.parse_next(input)?;
    let _ = '!'.parse_next(input)?;
    let _ = multispace0.parse_next(input)?;
    Ok(())
}

fn chain_separator(input: &mut &str) -> WResult<()> {
    let _ = multispace0.parse_next(input)?;
    let _ = ';'.parse_next(input)?;
    let _ = multispace0.parse_next(input)?;
    Ok(())
}

fn identifier<'a>(input: &mut &'a str) -> WResult<&'a str> {
    (
        alt((alpha1::<_, ContextError>, "_")),
        take_while(0.., |c: char| c.is_alphanumeric() || c == '_' || c == '-'),
    )
        .take()
        .parse_next(input)
}

fn property(input: &mut &str) -> WResult<(String, ParsedValue)> {
    let _ = multispace0.parse_next(input)?;

    let checkpoint = *input;

    let key: &str = match identifier.parse_next(input) {
        Ok(k) => k,
        Err(_) => {
            *input = checkpoint;
            return Err(ContextError::new());
        }
    };

    let _ = multispace0.parse_next(input)?;

    if input.starts_with('=') {
        let _ = '='.parse_next(input)?;
    } else {
        *input = checkpoint;
        return Err(ContextError::new());
    }

    let _ = multispace0.parse_next(input)?;
    let value = property_value.parse_next(input)?;
    let _ = multispace0.parse_next(input)?;

    Ok((key.to_string(), value))
}

fn property_value(input: &mut &str) -> WResult<ParsedValue> {
    alt((
        quoted_string.map(ParsedValue::String),
        terminated_literal(boolean).map(ParsedValue::Bool),
        terminated_literal(float).map(ParsedValue::Float),
        terminated_literal(integer).map(ParsedValue::Integer),
        bare_string.map(ParsedValue::String),
    ))
    .parse_next(input)
}

/// Accept a literal only if a value boundary follows it, so `true-ish`
/// and `90k` fall through to a bare string.
fn terminated_literal<'a, O>(
    mut literal: impl FnMut(&mut &'a str) -> WResult<O>,
) -> impl FnMut(&mut &'a str) -> WResult<O> {
    move |input: &mut &'a str| {
        let checkpoint = *input;
        let value = literal(input)?;
        match input.chars().next() {
            None => Ok(value),
            Some(c) if c.is_whitespace() || c == '!' || c == ';' => Ok(value),
            Some(_) => {
                *input = checkpoint;
                Err(ContextError::new())
            }
        }
    }
}

fn quoted_string(input: &mut &str) -> WResult<String> {
    alt((
        delimited('"', take_till(0.., '"'), '"'),
        delimited('\'', take_till(0.., '\''), '\''),
    ))
    .map(|s: &str| s.to_string())
    .parse_next(input)
}

fn boolean(input: &mut &str) -> WResult<bool> {
    alt(("true".map(|_| true), "false".map(|_| false))).parse_next(input)
}

fn integer(input: &mut &str) -> WResult<i64> {
    let negative = opt('-').parse_next(input)?;
    let digits: &str = digit1.parse_next(input)?;

    if input.starts_with('.') {
        return Err(ContextError::new());
    }

    let value: i64 = digits.parse().map_err(|_| ContextError::new())?;

    Ok(if negative.is_some() { -value } else { value })
}

fn float(input: &mut &str) -> WResult<f64> {
    let text: &str = (opt('-'), digit1, '.', digit1).take().parse_next(input)?;
    text.parse().map_err(|_| ContextError::new())
}

/// Bare (unquoted) word. Stops at whitespace, `!` or `;`.
fn bare_string(input: &mut &str) -> WResult<String> {
    take_while(1.., |c: char| {
        !c.is_whitespace() && c != '!' && c != ';' && c != '='
    })
    .map(|s: &str| s.to_string())
    .parse_next(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chain() {
        let result = parse_description("packetsrc ! identity ! appsink").unwrap();
        assert_eq!(result.chains.len(), 1);
        let names: Vec<_> = result.chains[0].iter().map(|e| e.factory.as_str()).collect();
        assert_eq!(names, ["packetsrc", "identity", "appsink"]);
    }

    #[test]
    fn test_parse_properties() {
        let result =
            parse_description("packetsrc name=src max-packet-size=1500 is-live=true ! appsink")
                .unwrap();
        let src = &result.chains[0][0];
        assert_eq!(src.name(), Some("src"));
        assert_eq!(
            src.properties[1],
            ("max-packet-size".to_string(), ParsedValue::Integer(1500))
        );
        assert_eq!(
            src.properties[2],
            ("is-live".to_string(), ParsedValue::Bool(true))
        );
    }

    #[test]
    fn test_parse_multiple_chains() {
        let result =
            parse_description("packetsrc name=a ! appsink ; packetsrc name=b ! feedbacksink")
                .unwrap();
        assert_eq!(result.chains.len(), 2);
        assert_eq!(result.chains[1][1].factory, "feedbacksink");
        assert_eq!(result.elements().count(), 4);
    }

    #[test]
    fn test_parse_inline_caps() {
        let result = parse_description(
            "packetsrc ! application/x-rtp,media=(string)video,clock-rate=(int)90000 ! appsink",
        )
        .unwrap();
        let caps = &result.chains[0][1];
        assert_eq!(caps.factory, CAPSFILTER);
        assert_eq!(
            caps.properties[0].1,
            ParsedValue::String(
                "application/x-rtp,media=(string)video,clock-rate=(int)90000".into()
            )
        );
    }

    #[test]
    fn test_parse_quoted_caps_property() {
        let result =
            parse_description(r#"capsfilter caps="application/x-rtp, payload=(int)96""#).unwrap();
        assert_eq!(
            result.chains[0][0].properties[0].1,
            ParsedValue::String("application/x-rtp, payload=(int)96".into())
        );
    }

    #[test]
    fn test_literal_boundaries() {
        let result = parse_description("identity label=90k rate=1.5 offset=-100").unwrap();
        let props = &result.chains[0][0].properties;
        assert_eq!(props[0].1, ParsedValue::String("90k".into()));
        assert_eq!(props[1].1, ParsedValue::Float(1.5));
        assert_eq!(props[2].1, ParsedValue::Integer(-100));
    }

    #[test]
    fn test_to_property() {
        assert!(matches!(
            ParsedValue::Integer(7).to_property(PropertyType::Int64),
            Some(PropertyValue::Int64(7))
        ));
        assert!(matches!(
            ParsedValue::Integer(7).to_property(PropertyType::String),
            Some(PropertyValue::String(s)) if s == "7"
        ));
        assert!(ParsedValue::String("x".into()).to_property(PropertyType::Int64).is_none());
        assert!(ParsedValue::String("x".into()).to_property(PropertyType::Opaque).is_none());
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_description("").is_err());
        assert!(parse_description("!").is_err());
        assert!(parse_description("a ! ! b").is_err());
    }
}
