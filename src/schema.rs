// ===============================
// src/schema.rs (audit log schema validation)
// ===============================
//
// Validates documents against the subset of XML Schema the audit log uses:
//   - global <element name type>
//   - <complexType> with one <all>, <sequence> or <choice> of <element>s
//     (minOccurs / maxOccurs, "unbounded")
//   - <simpleType><restriction base="xsd:..."> with enumeration, minLength,
//     maxLength, minInclusive, maxInclusive
//   - built-ins: string, integer, long, positiveInteger, nonNegativeInteger,
//     unsignedLong, decimal
// Anything else in the schema is rejected at load time.
//
use std::fmt;
use std::path::Path;

use ahash::{AHashMap, AHashSet};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

/// Narrow seam over the validation engine.
pub trait SchemaValidator: Send + Sync {
    /// Empty when `document` conforms.
    fn validate(&self, document: &str) -> Vec<Violation>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Element path, e.g. `/log/userCommand[1]/funds`.
    pub path: String,
    pub message: String,
}

impl Violation {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self { path: path.into(), message: message.into() }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("cannot read schema {path}: {source}")]
    Read { path: String, #[source] source: std::io::Error },
    #[error("malformed XML: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("malformed document: {0}")]
    Structure(String),
    #[error("unsupported schema construct: {0}")]
    Unsupported(String),
    #[error("unknown type reference {0:?}")]
    UnknownType(String),
}

// ---------- minimal element tree ----------

#[derive(Debug, Default)]
struct Node {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
    text: String,
}

impl Node {
    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    fn required(&self, key: &str) -> Result<&str, SchemaError> {
        self.attr(key)
            .ok_or_else(|| SchemaError::Structure(format!("<{}> without {key:?}", self.name)))
    }

    /// Children that carry meaning (annotations skipped).
    fn items(&self) -> impl Iterator<Item = &Node> {
        self.children.iter().filter(|c| c.name != "annotation")
    }
}

fn open(e: &BytesStart<'_>) -> Result<Node, SchemaError> {
    let mut node = Node {
        name: String::from_utf8_lossy(e.local_name().as_ref()).into_owned(),
        ..Default::default()
    };
    for a in e.attributes() {
        let a = a.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(a.key.local_name().as_ref()).into_owned();
        node.attrs.push((key, a.unescape_value()?.into_owned()));
    }
    Ok(node)
}

fn attach(stack: &mut Vec<Node>, root: &mut Option<Node>, node: Node) -> Result<(), SchemaError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None if root.is_none() => *root = Some(node),
        None => return Err(SchemaError::Structure(format!("second root element <{}>", node.name))),
    }
    Ok(())
}

fn parse_tree(xml: &str) -> Result<Node, SchemaError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut stack: Vec<Node> = Vec::new();
    let mut root: Option<Node> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => stack.push(open(&e)?),
            Event::Empty(e) => {
                let node = open(&e)?;
                attach(&mut stack, &mut root, node)?;
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| SchemaError::Structure("unbalanced end tag".into()))?;
                attach(&mut stack, &mut root, node)?;
            }
            Event::Text(t) => {
                let text = t.unescape()?;
                match stack.last_mut() {
                    Some(top) => top.text.push_str(&text),
                    None => return Err(SchemaError::Structure("text outside the root element".into())),
                }
            }
            Event::CData(c) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::Eof => break,
            // declaration, comments, processing instructions
            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        return Err(SchemaError::Structure(format!("unclosed element <{}>", open.name)));
    }
    root.ok_or_else(|| SchemaError::Structure("empty document".into()))
}

// ---------- schema model ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Builtin {
    String,
    Integer,
    Long,
    PositiveInteger,
    NonNegativeInteger,
    UnsignedLong,
    Decimal,
}

impl Builtin {
    fn from_name(local: &str) -> Option<Self> {
        Some(match local {
            "string" => Builtin::String,
            "integer" => Builtin::Integer,
            "long" => Builtin::Long,
            "positiveInteger" => Builtin::PositiveInteger,
            "nonNegativeInteger" => Builtin::NonNegativeInteger,
            "unsignedLong" => Builtin::UnsignedLong,
            "decimal" => Builtin::Decimal,
            _ => return None,
        })
    }

    fn integral(self) -> bool {
        !matches!(self, Builtin::String | Builtin::Decimal)
    }

    fn check(self, v: &str) -> Result<(), String> {
        let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        let unsigned = v.strip_prefix('+').unwrap_or(v);
        let signed = v.strip_prefix(['+', '-']).unwrap_or(v);
        let ok = match self {
            Builtin::String => true,
            Builtin::Integer => digits(signed),
            Builtin::Long => digits(signed) && v.parse::<i64>().is_ok(),
            Builtin::NonNegativeInteger => digits(unsigned),
            Builtin::PositiveInteger => digits(unsigned) && unsigned.bytes().any(|b| b != b'0'),
            Builtin::UnsignedLong => digits(unsigned) && unsigned.parse::<u64>().is_ok(),
            Builtin::Decimal => match signed.split_once('.') {
                Some((w, f)) => (w.is_empty() || digits(w)) && (f.is_empty() || digits(f)) && !(w.is_empty() && f.is_empty()),
                None => digits(signed),
            },
        };
        if ok { Ok(()) } else { Err(format!("{v:?} is not a valid {self:?}")) }
    }
}

#[derive(Debug, Clone)]
enum TypeRef {
    Builtin(Builtin),
    Simple(String),
    Complex(String),
}

#[derive(Debug, Clone)]
struct ElementDecl {
    name: String,
    ty: TypeRef,
    min: u32,
    /// `None` = unbounded.
    max: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
enum Compositor {
    All,
    Sequence,
    Choice,
}

#[derive(Debug, Clone)]
struct ComplexType {
    compositor: Compositor,
    min: u32,
    max: Option<u32>,
    elements: Vec<ElementDecl>,
}

#[derive(Debug, Clone)]
enum Facet {
    Enumeration(Vec<String>),
    MinLength(usize),
    MaxLength(usize),
    MinInclusive(i128),
    MaxInclusive(i128),
}

#[derive(Debug, Clone)]
struct SimpleType {
    base: Builtin,
    facets: Vec<Facet>,
}

struct Names {
    complex: AHashSet<String>,
    simple: AHashSet<String>,
}

impl Names {
    fn resolve(&self, raw: &str) -> Result<TypeRef, SchemaError> {
        let (prefix, local) = match raw.split_once(':') {
            Some((p, l)) => (Some(p), l),
            None => (None, raw),
        };
        let declared = self.complex.contains(local) || self.simple.contains(local);
        // unprefixed names prefer the schema's own types
        if prefix.is_some() || !declared {
            if let Some(b) = Builtin::from_name(local) {
                return Ok(TypeRef::Builtin(b));
            }
        }
        if self.complex.contains(local) {
            Ok(TypeRef::Complex(local.to_string()))
        } else if self.simple.contains(local) {
            Ok(TypeRef::Simple(local.to_string()))
        } else {
            Err(SchemaError::UnknownType(raw.to_string()))
        }
    }
}

fn occurs(node: &Node, key: &str) -> Result<Option<u32>, SchemaError> {
    match node.attr(key) {
        None => Ok(Some(1)),
        Some("unbounded") => Ok(None),
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| SchemaError::Structure(format!("{key}={v:?} on <{}>", node.name))),
    }
}

fn element_decl(node: &Node, names: &Names) -> Result<ElementDecl, SchemaError> {
    let name = node.required("name")?.to_string();
    let ty = match node.attr("type") {
        Some(t) => names.resolve(t)?,
        None => return Err(SchemaError::Unsupported(format!("anonymous type on element {name:?}"))),
    };
    Ok(ElementDecl {
        name,
        ty,
        min: occurs(node, "minOccurs")?.unwrap_or(0),
        max: occurs(node, "maxOccurs")?,
    })
}

fn complex_type(node: &Node, names: &Names) -> Result<ComplexType, SchemaError> {
    let mut groups = node.items();
    let Some(group) = groups.next() else {
        return Ok(ComplexType { compositor: Compositor::Sequence, min: 1, max: Some(1), elements: vec![] });
    };
    if let Some(extra) = groups.next() {
        return Err(SchemaError::Unsupported(format!("<{}> after <{}> in complexType", extra.name, group.name)));
    }
    let compositor = match group.name.as_str() {
        "all" => Compositor::All,
        "sequence" => Compositor::Sequence,
        "choice" => Compositor::Choice,
        other => return Err(SchemaError::Unsupported(format!("<{other}> in complexType"))),
    };
    let elements = group
        .items()
        .map(|c| match c.name.as_str() {
            "element" => element_decl(c, names),
            other => Err(SchemaError::Unsupported(format!("<{other}> inside <{}>", group.name))),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ComplexType {
        compositor,
        min: occurs(group, "minOccurs")?.unwrap_or(0),
        max: occurs(group, "maxOccurs")?,
        elements,
    })
}

fn simple_type(node: &Node) -> Result<SimpleType, SchemaError> {
    let restriction = node
        .items()
        .find(|c| c.name == "restriction")
        .ok_or_else(|| SchemaError::Unsupported("simpleType without <restriction>".into()))?;
    let base_raw = restriction.required("base")?;
    let base_local = base_raw.rsplit(':').next().unwrap_or(base_raw);
    let base = Builtin::from_name(base_local)
        .ok_or_else(|| SchemaError::Unsupported(format!("restriction of {base_raw:?}")))?;

    let mut facets = Vec::new();
    let mut enumeration = Vec::new();
    for f in restriction.items() {
        let value = f.required("value")?;
        let bad = || SchemaError::Structure(format!("<{} value={value:?}>", f.name));
        match f.name.as_str() {
            "enumeration" => enumeration.push(value.to_string()),
            "minLength" => facets.push(Facet::MinLength(value.parse().map_err(|_| bad())?)),
            "maxLength" => facets.push(Facet::MaxLength(value.parse().map_err(|_| bad())?)),
            "minInclusive" | "maxInclusive" => {
                if !base.integral() {
                    return Err(SchemaError::Unsupported(format!("<{}> on {base:?}", f.name)));
                }
                let n: i128 = value.parse().map_err(|_| bad())?;
                facets.push(if f.name == "minInclusive" { Facet::MinInclusive(n) } else { Facet::MaxInclusive(n) });
            }
            other => return Err(SchemaError::Unsupported(format!("facet <{other}>"))),
        }
    }
    if !enumeration.is_empty() {
        facets.push(Facet::Enumeration(enumeration));
    }
    Ok(SimpleType { base, facets })
}

/// Loaded XML Schema (subset).
#[derive(Debug)]
pub struct XsdSchema {
    roots: Vec<ElementDecl>,
    complex: AHashMap<String, ComplexType>,
    simple: AHashMap<String, SimpleType>,
}

impl XsdSchema {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|source| SchemaError::Read { path: path.display().to_string(), source })?;
        Self::parse(&text)
    }

    pub fn parse(xsd: &str) -> Result<Self, SchemaError> {
        let root = parse_tree(xsd)?;
        if root.name != "schema" {
            return Err(SchemaError::Structure(format!("root <{}> is not <schema>", root.name)));
        }

        let mut names = Names { complex: AHashSet::new(), simple: AHashSet::new() };
        for c in root.items() {
            match c.name.as_str() {
                "complexType" => { names.complex.insert(c.required("name")?.to_string()); }
                "simpleType" => { names.simple.insert(c.required("name")?.to_string()); }
                _ => {}
            }
        }

        let mut schema = XsdSchema { roots: Vec::new(), complex: AHashMap::new(), simple: AHashMap::new() };
        for c in root.items() {
            match c.name.as_str() {
                "element" => schema.roots.push(element_decl(c, &names)?),
                "complexType" => {
                    schema.complex.insert(c.required("name")?.to_string(), complex_type(c, &names)?);
                }
                "simpleType" => {
                    schema.simple.insert(c.required("name")?.to_string(), simple_type(c)?);
                }
                other => return Err(SchemaError::Unsupported(format!("top-level <{other}>"))),
            }
        }
        if schema.roots.is_empty() {
            return Err(SchemaError::Structure("schema declares no global element".into()));
        }
        Ok(schema)
    }

    fn check_element(&self, node: &Node, ty: &TypeRef, path: &str, out: &mut Vec<Violation>) {
        match ty {
            TypeRef::Complex(name) => {
                if let Some(ct) = self.complex.get(name) {
                    self.check_complex(node, ct, path, out);
                }
            }
            TypeRef::Builtin(b) => self.check_simple(node, *b, &[], path, out),
            TypeRef::Simple(name) => {
                if let Some(st) = self.simple.get(name) {
                    self.check_simple(node, st.base, &st.facets, path, out);
                }
            }
        }
    }

    fn check_complex(&self, node: &Node, ct: &ComplexType, path: &str, out: &mut Vec<Violation>) {
        if !node.text.trim().is_empty() {
            out.push(Violation::new(path, "text is not allowed in element-only content"));
        }
        let child_path = |i: usize, c: &Node| format!("{path}/{}[{}]", c.name, i + 1);
        let decl_of = |name: &str| ct.elements.iter().find(|d| d.name == name);

        match ct.compositor {
            Compositor::All | Compositor::Choice => {
                let mut counts: AHashMap<&str, u32> = AHashMap::new();
                let mut total = 0u32;
                for (i, c) in node.children.iter().enumerate() {
                    match decl_of(&c.name) {
                        Some(d) => {
                            *counts.entry(d.name.as_str()).or_default() += 1;
                            total += 1;
                            self.check_element(c, &d.ty, &child_path(i, c), out);
                        }
                        None => out.push(Violation::new(child_path(i, c), "unexpected element")),
                    }
                }
                if let Compositor::All = ct.compositor {
                    for d in &ct.elements {
                        let n = counts.get(d.name.as_str()).copied().unwrap_or(0);
                        if n < d.min {
                            out.push(Violation::new(path, format!("missing required element <{}>", d.name)));
                        }
                        if let Some(max) = d.max {
                            if n > max {
                                out.push(Violation::new(path, format!("<{}> occurs {n} times, at most {max} allowed", d.name)));
                            }
                        }
                    }
                } else {
                    if total < ct.min {
                        out.push(Violation::new(path, format!("expected at least {} child elements, found {total}", ct.min)));
                    }
                    if let Some(max) = ct.max {
                        if total > max {
                            out.push(Violation::new(path, format!("expected at most {max} child elements, found {total}")));
                        }
                    }
                }
            }
            Compositor::Sequence => {
                let mut idx = 0;
                for d in &ct.elements {
                    let mut n = 0u32;
                    while idx < node.children.len()
                        && node.children[idx].name == d.name
                        && d.max.map_or(true, |m| n < m)
                    {
                        let c = &node.children[idx];
                        self.check_element(c, &d.ty, &child_path(idx, c), out);
                        idx += 1;
                        n += 1;
                    }
                    if n < d.min {
                        out.push(Violation::new(path, format!("missing required element <{}>", d.name)));
                    }
                }
                for (i, c) in node.children.iter().enumerate().skip(idx) {
                    out.push(Violation::new(child_path(i, c), "unexpected element"));
                }
            }
        }
    }

    fn check_simple(&self, node: &Node, base: Builtin, facets: &[Facet], path: &str, out: &mut Vec<Violation>) {
        if !node.children.is_empty() {
            out.push(Violation::new(path, "child elements are not allowed in simple content"));
            return;
        }
        let v = if base == Builtin::String { node.text.as_str() } else { node.text.trim() };
        if let Err(msg) = base.check(v) {
            out.push(Violation::new(path, msg));
            return;
        }
        for f in facets {
            let failed = match f {
                Facet::Enumeration(allowed) => (!allowed.iter().any(|a| a == v))
                    .then(|| format!("{v:?} is not one of the allowed values")),
                Facet::MinLength(n) => (v.chars().count() < *n).then(|| format!("{v:?} is shorter than {n}")),
                Facet::MaxLength(n) => (v.chars().count() > *n).then(|| format!("{v:?} is longer than {n}")),
                Facet::MinInclusive(n) => match v.trim_start_matches('+').parse::<i128>() {
                    Ok(x) if x >= *n => None,
                    _ => Some(format!("{v} is below {n}")),
                },
                Facet::MaxInclusive(n) => match v.trim_start_matches('+').parse::<i128>() {
                    Ok(x) if x <= *n => None,
                    _ => Some(format!("{v} is above {n}")),
                },
            };
            if let Some(msg) = failed {
                out.push(Violation::new(path, msg));
            }
        }
    }
}

impl SchemaValidator for XsdSchema {
    fn validate(&self, document: &str) -> Vec<Violation> {
        let root = match parse_tree(document) {
            Ok(n) => n,
            Err(e) => return vec![Violation::new("/", format!("not well-formed: {e}"))],
        };
        let path = format!("/{}", root.name);
        let mut out = Vec::new();
        match self.roots.iter().find(|d| d.name == root.name) {
            Some(d) => self.check_element(&root, &d.ty, &path, &mut out),
            None => out.push(Violation::new(path, "element is not declared at top level")),
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_schema() -> XsdSchema {
        XsdSchema::load(concat!(env!("CARGO_MANIFEST_DIR"), "/schema/log.xsd")).unwrap()
    }

    const GOOD: &str = r#"<?xml version="1.0"?>
<log>
	<userCommand>
		<timestamp>1600000000000</timestamp>
		<server>transaction</server>
		<transactionNum>1</transactionNum>
		<command>ADD</command>
		<username>alice</username>
		<funds>100.00</funds>
	</userCommand>
	<quoteServer>
		<timestamp>1600000000001</timestamp>
		<server>transaction</server>
		<transactionNum>2</transactionNum>
		<quoteServerTime>1600000000000</quoteServerTime>
		<username>alice</username>
		<stockSymbol>ABC</stockSymbol>
		<price>5.01</price>
		<cryptokey>c2ln</cryptokey>
	</quoteServer>
</log>"#;

    #[test]
    fn shipped_schema_accepts_log() {
        let v = log_schema().validate(GOOD);
        assert!(v.is_empty(), "{v:?}");
        assert!(log_schema().validate("<log/>").is_empty());
    }

    #[test]
    fn reports_each_violation_with_path() {
        let doc = GOOD
            .replace("<command>ADD</command>", "<command>TRANSFER</command>")
            .replace("<funds>100.00</funds>", "<funds>lots</funds>")
            .replace("<stockSymbol>ABC</stockSymbol>", "<stockSymbol>ABCDE</stockSymbol>")
            .replace("<transactionNum>2</transactionNum>", "<transactionNum>0</transactionNum>");
        let v = log_schema().validate(&doc);
        assert_eq!(v.len(), 4, "{v:?}");
        assert!(v.iter().any(|x| x.path == "/log/userCommand[1]/command[4]"));
        assert!(v.iter().any(|x| x.path == "/log/quoteServer[2]/stockSymbol[6]"));
    }

    #[test]
    fn structural_violations() {
        let s = log_schema();
        let missing = "<log><accountTransaction><timestamp>1600000000000</timestamp>\
                       <server>t</server><transactionNum>1</transactionNum><action>add</action>\
                       <username>a</username></accountTransaction></log>";
        let v = s.validate(missing);
        assert_eq!(v.len(), 1);
        assert!(v[0].message.contains("<funds>"));

        let v = s.validate("<log><debugEvent/></log>");
        assert_eq!(v[0].message, "unexpected element");

        let v = s.validate("<records/>");
        assert_eq!(v[0].path, "/records");

        let v = s.validate("<log><userCommand>");
        assert!(v[0].message.starts_with("not well-formed"));

        // timestamp outside the accepted window
        let v = s.validate(&GOOD.replace("1600000000001", "12"));
        assert_eq!(v.len(), 1);
        assert!(v[0].message.contains("below"));
    }

    #[test]
    fn sequence_and_occurs() {
        let xsd = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
            <xs:element name="order" type="Order"/>
            <xs:complexType name="Order">
                <xs:sequence>
                    <xs:element name="id" type="xs:long"/>
                    <xs:element name="line" type="xs:string" maxOccurs="2"/>
                    <xs:element name="note" type="xs:string" minOccurs="0"/>
                </xs:sequence>
            </xs:complexType>
        </xs:schema>"#;
        let s = XsdSchema::parse(xsd).unwrap();
        assert!(s.validate("<order><id>-3</id><line>a</line><line>b</line></order>").is_empty());
        // out of order
        assert!(!s.validate("<order><line>a</line><id>1</id></order>").is_empty());
        // too many
        let v = s.validate("<order><id>1</id><line>a</line><line>b</line><line>c</line></order>");
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].path, "/order/line[4]");
    }

    #[test]
    fn rejects_unsupported_schema() {
        let pattern = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
            <xs:element name="a" type="T"/>
            <xs:simpleType name="T"><xs:restriction base="xs:string"><xs:pattern value="[a-z]+"/></xs:restriction></xs:simpleType>
        </xs:schema>"#;
        assert!(matches!(XsdSchema::parse(pattern), Err(SchemaError::Unsupported(_))));

        let dangling = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"><xs:element name="a" type="Nope"/></xs:schema>"#;
        assert!(matches!(XsdSchema::parse(dangling), Err(SchemaError::UnknownType(_))));

        assert!(matches!(XsdSchema::load("/nonexistent.xsd"), Err(SchemaError::Read { .. })));
    }

    #[test]
    fn builtin_lexical_forms() {
        assert!(Builtin::Decimal.check("123.45").is_ok());
        assert!(Builtin::Decimal.check("-.5").is_ok());
        assert!(Builtin::Decimal.check(".").is_err());
        assert!(Builtin::PositiveInteger.check("007").is_ok());
        assert!(Builtin::PositiveInteger.check("000").is_err());
        assert!(Builtin::UnsignedLong.check("-1").is_err());
        assert!(Builtin::Long.check("99999999999999999999").is_err());
    }
}
