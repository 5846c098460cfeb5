use lazy_static::lazy_static;
use log::{debug, warn};
use nom::{
    bytes::complete::take_while1,
    character::complete::{char, space0},
    combinator::{all_consuming, map},
    multi::separated_list1,
    number::complete::double,
    sequence::delimited,
    IResult,
};
use regex::Regex;
use std::fs;
use std::path::Path;

use crate::circuit::{BranchCurrent, CurrentLayout, DerivedCurrent, SourceType};
use crate::error::{NetworkError, Result};

lazy_static! {
    static ref BLOCK_PATTERN: Regex = Regex::new(r"(resistor|source|loop|current|balance)").unwrap();

    static ref KEY_VALUE_PATTERN: Regex = Regex::new(r"^\s*([^=]+?)\s*=\s*(.*?)\s*$").unwrap();
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResistorDef {
    pub name: String,
    pub resistance: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceDef {
    pub name: String,
    pub voltage: f64,
    pub source_type: SourceType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopDef {
    pub name: String,
    pub nodes: Vec<String>,
}

/// A node whose current balance is either an equation or derives one resistor current
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceDef {
    pub node: String,
    pub derive: Option<String>,
}

/// Resistor network as read from a definition file, before validation
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkDescription {
    pub title: String,
    pub resistors: Vec<ResistorDef>,
    pub sources: Vec<SourceDef>,
    pub loops: Vec<LoopDef>,
    pub currents: Vec<BranchCurrent>,
    pub balances: Vec<BalanceDef>,
}

impl NetworkDescription {
    pub fn new(title: &str) -> Self {
        NetworkDescription {
            title: title.to_string(),
            resistors: Vec::new(),
            sources: Vec::new(),
            loops: Vec::new(),
            currents: Vec::new(),
            balances: Vec::new(),
        }
    }

    /// Current layout declared by the `current` and `balance` blocks
    pub fn layout(&self) -> CurrentLayout {
        let mut layout = CurrentLayout::new();
        layout.unknowns = self.currents.clone();
        for balance in &self.balances {
            match &balance.derive {
                Some(segment) => layout.derived.push(DerivedCurrent {
                    segment: segment.clone(),
                    node: balance.node.clone(),
                }),
                None => layout.balance_nodes.push(balance.node.clone()),
            }
        }
        layout
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Resistor,
    Source,
    Loop,
    Current,
    Balance,
}

impl BlockKind {
    fn detect(line: &str) -> Option<Self> {
        let captures = BLOCK_PATTERN.captures(line)?;
        match captures.get(1)?.as_str() {
            "resistor" => Some(BlockKind::Resistor),
            "source" => Some(BlockKind::Source),
            "loop" => Some(BlockKind::Loop),
            "current" => Some(BlockKind::Current),
            "balance" => Some(BlockKind::Balance),
            _ => None,
        }
    }

    fn keyword(self) -> &'static str {
        match self {
            BlockKind::Resistor => "resistor",
            BlockKind::Source => "source",
            BlockKind::Loop => "loop",
            BlockKind::Current => "current",
            BlockKind::Balance => "balance",
        }
    }
}

#[derive(Debug)]
struct Field {
    line: usize,
    key: String,
    value: String,
}

/// Reader for the block-structured resistor network format.
///
/// ```text
/// # comment
/// <Resistor>
/// name = ad
/// resistance = 3
/// </Resistor>
/// <Loop>
/// name = A
/// nodes = a,b,c,d
/// </Loop>
/// ```
///
/// A block opens on a line containing its keyword and closes on the next such
/// line. Lines with `=` are always fields, so `name = loop1` inside a loop block
/// does not close it. Keys are matched by substring and everything is
/// case-insensitive.
pub struct NetworkParser;

impl Default for NetworkParser {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkParser {
    pub fn new() -> Self {
        NetworkParser
    }

    pub fn parse_file<P: AsRef<Path>>(&self, path: P) -> Result<NetworkDescription> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let mut description = self.parse_str(&content)?;
        if description.title.is_empty() {
            description.title = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
        Ok(description)
    }

    pub fn parse_str(&self, content: &str) -> Result<NetworkDescription> {
        let mut description = NetworkDescription::new("");
        let mut lines = content.lines().enumerate().map(|(i, line)| (i + 1, line));

        while let Some((line_num, raw)) = lines.next() {
            let line = raw.trim().to_lowercase();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = split_key_value(raw.trim()) {
                if key.to_lowercase().contains("title") {
                    description.title = value;
                } else {
                    warn!("Ignoring field '{}' outside any block at line {}", key, line_num);
                }
                continue;
            }

            match BlockKind::detect(&line) {
                Some(kind) => {
                    let fields = collect_block(kind, line_num, &mut lines)?;
                    add_block(&mut description, kind, line_num, fields)?;
                }
                None => warn!("Ignoring line {}: {}", line_num, raw.trim()),
            }
        }

        debug!(
            "Parsed network '{}': {} resistors, {} sources, {} loops, {} currents",
            description.title,
            description.resistors.len(),
            description.sources.len(),
            description.loops.len(),
            description.currents.len()
        );
        Ok(description)
    }
}

fn split_key_value(line: &str) -> Option<(String, String)> {
    let captures = KEY_VALUE_PATTERN.captures(line)?;
    Some((
        captures.get(1)?.as_str().to_string(),
        captures.get(2)?.as_str().to_string(),
    ))
}

/// Read `key = value` lines up to the line that closes `kind`
fn collect_block<'a, I>(kind: BlockKind, opened_at: usize, lines: &mut I) -> Result<Vec<Field>>
where
    I: Iterator<Item = (usize, &'a str)>,
{
    let mut fields = Vec::new();
    for (line_num, raw) in lines.by_ref() {
        let line = raw.trim().to_lowercase();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match split_key_value(&line) {
            Some((key, value)) => fields.push(Field {
                line: line_num,
                key,
                value,
            }),
            None if line.contains(kind.keyword()) => return Ok(fields),
            None => {
                return Err(NetworkError::parse(
                    line_num,
                    format!("expected 'key = value' in {} block, found '{}'", kind.keyword(), raw.trim()),
                ))
            }
        }
    }
    Err(NetworkError::parse(
        opened_at,
        format!("{} block is never closed", kind.keyword()),
    ))
}

fn add_block(
    description: &mut NetworkDescription,
    kind: BlockKind,
    opened_at: usize,
    fields: Vec<Field>,
) -> Result<()> {
    let mut name = None;
    let mut number = None;
    let mut text = None;
    let mut list = None;

    for field in &fields {
        let key = field.key.as_str();
        match kind {
            BlockKind::Resistor if key.contains("resistance") || key.contains("value") => {
                number = Some(parse_number(field)?)
            }
            BlockKind::Source if key.contains("value") || key.contains("voltage") => {
                number = Some(parse_number(field)?)
            }
            BlockKind::Source if key.contains("type") => text = Some(field.value.clone()),
            BlockKind::Loop if key.contains("nodes") => list = Some(parse_list(field)?),
            BlockKind::Current if key.contains("path") => list = Some(parse_list(field)?),
            BlockKind::Current if key.contains("guess") => number = Some(parse_number(field)?),
            BlockKind::Balance if key.contains("derive") => text = Some(field.value.clone()),
            BlockKind::Balance if key.contains("node") => name = Some(field.value.clone()),
            _ if key.contains("name") => name = Some(field.value.clone()),
            _ => warn!(
                "Ignoring unknown key '{}' in {} block at line {}",
                key,
                kind.keyword(),
                field.line
            ),
        }
    }

    let missing = |what: &str| NetworkError::parse(opened_at, format!("{} block has no {}", kind.keyword(), what));

    match kind {
        BlockKind::Resistor => description.resistors.push(ResistorDef {
            name: name.ok_or_else(|| missing("name"))?,
            resistance: number.ok_or_else(|| missing("resistance"))?,
        }),
        BlockKind::Source => {
            let source_type = match text {
                Some(t) => t.parse::<SourceType>().map_err(|e| NetworkError::parse(opened_at, e))?,
                None => SourceType::default(),
            };
            description.sources.push(SourceDef {
                name: name.ok_or_else(|| missing("name"))?,
                voltage: number.ok_or_else(|| missing("value"))?,
                source_type,
            })
        }
        BlockKind::Loop => {
            let name = name.unwrap_or_else(|| format!("L{}", description.loops.len() + 1));
            description.loops.push(LoopDef {
                name,
                nodes: list.ok_or_else(|| missing("nodes"))?,
            })
        }
        BlockKind::Current => {
            let name = name.unwrap_or_else(|| format!("I{}", description.currents.len() + 1));
            description.currents.push(BranchCurrent {
                name,
                path: list.ok_or_else(|| missing("path"))?,
                guess: number.unwrap_or(0.0),
            })
        }
        BlockKind::Balance => description.balances.push(BalanceDef {
            node: name.ok_or_else(|| missing("node"))?,
            derive: text,
        }),
    }
    Ok(())
}

fn parse_number(field: &Field) -> Result<f64> {
    all_consuming(number)(field.value.as_str())
        .map(|(_, value)| value)
        .map_err(|_| NetworkError::parse(field.line, format!("invalid number '{}' for {}", field.value, field.key)))
}

fn parse_list(field: &Field) -> Result<Vec<String>> {
    all_consuming(name_list)(field.value.as_str())
        .map(|(_, names)| names)
        .map_err(|_| NetworkError::parse(field.line, format!("invalid list '{}' for {}", field.value, field.key)))
}

fn number(input: &str) -> IResult<&str, f64> {
    delimited(space0, double, space0)(input)
}

fn name_list(input: &str) -> IResult<&str, Vec<String>> {
    separated_list1(delimited(space0, char(','), space0), list_item)(input)
}

fn list_item(input: &str) -> IResult<&str, String> {
    map(
        take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '-'),
        |s: &str| s.to_string(),
    )(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::ResistorNetwork;
    use crate::solver::SolverConfig;
    use approx::assert_relative_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const TWO_SOURCE_NETWORK: &str = "\
# Two sources driving four resistors
title = Two Source Network

<Resistor>
name = ad
resistance = 3
</Resistor>
<Resistor>
name = bc
resistance = 5
</Resistor>
<Resistor>
name = cd
resistance = 4
</Resistor>
<Resistor>
name = ce
resistance = 6
</Resistor>

<Source>
name = ab
value = 32
type = ideal
</Source>
<Source>
name = de
value = 16
type = Ideal
</Source>

<Loop>
name = A
nodes = a, b, c, d
</Loop>
<Loop>
name = B
nodes = c,e,d
</Loop>

<Current>
name = I1
path = bc, da
guess = 1
</Current>
<Current>
name = I2
path = ce
</Current>
<Current>
name = I3
path = cd
</Current>
<Balance>
node = c
</Balance>
";

    #[test]
    fn test_parse_full_network() {
        let description = NetworkParser::new().parse_str(TWO_SOURCE_NETWORK).unwrap();
        assert_eq!(description.title, "Two Source Network");
        assert_eq!(description.resistors.len(), 4);
        assert_eq!(
            description.resistors[0],
            ResistorDef {
                name: "ad".to_string(),
                resistance: 3.0
            }
        );
        assert_eq!(description.sources[1].voltage, 16.0);
        assert_eq!(description.sources[1].source_type, SourceType::Ideal);
        assert_eq!(description.loops[0].name, "a");
        assert_eq!(description.loops[0].nodes, vec!["a", "b", "c", "d"]);
        assert_eq!(description.currents[0].path, vec!["bc", "da"]);
        assert_eq!(description.currents[0].guess, 1.0);
        assert_eq!(description.currents[1].guess, 0.0);

        let layout = description.layout();
        assert_eq!(layout.unknowns.len(), 3);
        assert_eq!(layout.balance_nodes, vec!["c"]);
        assert!(layout.derived.is_empty());
    }

    #[test]
    fn test_parsed_network_solves_to_hand_currents() {
        let description = NetworkParser::new().parse_str(TWO_SOURCE_NETWORK).unwrap();
        let mut network = ResistorNetwork::from_description(&description).unwrap();
        let stats = network.analyze_circuit(None, &SolverConfig::default()).unwrap();
        assert!(stats.success);

        let branches = network.branch_currents().unwrap();
        assert_eq!(branches[0].0, "i1");
        assert_relative_eq!(branches[0].1, 32.0 / 13.0, epsilon = 1e-8);
        assert_relative_eq!(branches[1].1, -8.0 / 13.0, epsilon = 1e-8);
        assert_relative_eq!(branches[2].1, 40.0 / 13.0, epsilon = 1e-8);

        assert!(network.node_current("c").unwrap().abs() < 1e-9);
        assert!(network.loop_voltage("a").unwrap().abs() < 1e-9);
        assert!(network.loop_voltage("b").unwrap().abs() < 1e-9);
    }

    #[test]
    fn test_field_naming_its_block_keyword_stays_in_block() {
        let content = "<Loop>\nname = loop1\nnodes = a, b, c\n</Loop>\n";
        let description = NetworkParser::new().parse_str(content).unwrap();
        assert_eq!(description.loops.len(), 1);
        assert_eq!(description.loops[0].name, "loop1");
        assert_eq!(description.loops[0].nodes, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_keys_are_case_insensitive() {
        let content = "RESISTOR\nName = AB\nResistance = 2.5\nRESISTOR\n";
        let description = NetworkParser::new().parse_str(content).unwrap();
        assert_eq!(description.resistors[0].name, "ab");
        assert_eq!(description.resistors[0].resistance, 2.5);
    }

    #[test]
    fn test_balance_with_derive() {
        let content = "<balance>\nnode = c\nderive = bc\n</balance>\n";
        let description = NetworkParser::new().parse_str(content).unwrap();
        let layout = description.layout();
        assert!(layout.balance_nodes.is_empty());
        assert_eq!(layout.derived[0].segment, "bc");
        assert_eq!(layout.derived[0].node, "c");
    }

    #[test]
    fn test_unterminated_block_is_parse_error() {
        let content = "# truncated\n<Resistor>\nname = ad\nresistance = 3\n";
        match NetworkParser::new().parse_str(content) {
            Err(NetworkError::Parse { line, message }) => {
                assert_eq!(line, 2);
                assert!(message.contains("never closed"));
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_number_reports_line() {
        let content = "<Resistor>\nname = ad\nresistance = three\n</Resistor>\n";
        match NetworkParser::new().parse_str(content) {
            Err(NetworkError::Parse { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_resistance_is_rejected() {
        let content = "<Resistor>\nname = ad\n</Resistor>\n";
        assert!(matches!(
            NetworkParser::new().parse_str(content),
            Err(NetworkError::Parse { line: 1, .. })
        ));
    }

    #[test]
    fn test_node_list_parsing() {
        assert_eq!(
            name_list("a, b,c").unwrap().1,
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert_eq!(name_list("in-out,d-a").unwrap().1, vec!["in-out", "d-a"]);
        assert!(all_consuming(name_list)("a,,b").is_err());
    }

    #[test]
    fn test_parse_file_uses_stem_when_untitled() {
        let mut file = NamedTempFile::new().unwrap();
        let body = TWO_SOURCE_NETWORK.replace("title = Two Source Network\n", "");
        file.write_all(body.as_bytes()).unwrap();

        let description = NetworkParser::new().parse_file(file.path()).unwrap();
        let stem = file.path().file_stem().unwrap().to_string_lossy().into_owned();
        assert_eq!(description.title, stem);
        assert_eq!(description.resistors.len(), 4);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = NetworkParser::new().parse_file("/nonexistent/network.txt");
        assert!(matches!(result, Err(NetworkError::Io(_))));
    }
}
