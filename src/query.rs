//! Logical query requests: parsing, validation and canonical signatures.
//!
//! Requests arrive as JSON in the shape
//!
//! ```json
//! {"id": "q1", "select": ["day", {"SUM": "bid_price"}], "from": "events",
//!  "where": [{"col": "type", "op": "eq", "val": "impression"}],
//!  "group_by": ["day"], "order_by": [{"col": "day", "dir": "asc"}], "limit": 10}
//! ```
//!
//! The compact form `{"queryId", "filters": {"type", "dateRange", "country"},
//! "groupBy", "aggregate": {"field", "fn"}}` is accepted too.

use crate::error::{EngineError, Result};
use crate::event::{Column, EventType};
use crate::value::Value;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AggFunc {
    Sum,
    Avg,
    Count,
    Min,
    Max,
}

impl AggFunc {
    pub fn name(&self) -> &'static str {
        match self {
            AggFunc::Sum => "SUM",
            AggFunc::Avg => "AVG",
            AggFunc::Count => "COUNT",
            AggFunc::Min => "MIN",
            AggFunc::Max => "MAX",
        }
    }

    fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "SUM" => Ok(AggFunc::Sum),
            "AVG" | "MEAN" => Ok(AggFunc::Avg),
            "COUNT" => Ok(AggFunc::Count),
            "MIN" => Ok(AggFunc::Min),
            "MAX" => Ok(AggFunc::Max),
            other => Err(EngineError::query(format!(
                "unsupported aggregate function '{}'",
                other
            ))),
        }
    }
}

/// An aggregate over a column, or over rows (`COUNT(*)`) when `column` is
/// `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregateExpr {
    pub func: AggFunc,
    pub column: Option<Column>,
}

impl AggregateExpr {
    fn new(func: AggFunc, column: &str) -> Result<Self> {
        let column = match column.trim() {
            "*" if func == AggFunc::Count => None,
            "*" => {
                return Err(EngineError::query(format!(
                    "{}(*) is not supported",
                    func.name()
                )))
            }
            name => Some(resolve_column(name)?),
        };
        if let Some(column) = column {
            if func != AggFunc::Count && !column.is_numeric() {
                return Err(EngineError::query(format!(
                    "{} needs a numeric column, '{}' is not",
                    func.name(),
                    column
                )));
            }
        }
        Ok(Self { func, column })
    }

    /// Result column name, e.g. `SUM(bid_price)` or `COUNT(*)`.
    pub fn output_name(&self) -> String {
        match self.column {
            Some(column) => format!("{}({})", self.func.name(), column),
            None => format!("{}(*)", self.func.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectItem {
    Column(Column),
    Aggregate(AggregateExpr),
}

impl SelectItem {
    pub fn output_name(&self) -> String {
        match self {
            SelectItem::Column(column) => column.name().to_string(),
            SelectItem::Aggregate(agg) => agg.output_name(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PredicateOp {
    Eq(Value),
    Neq(Value),
    Lt(Value),
    Lte(Value),
    Gt(Value),
    Gte(Value),
    Between(Value, Value),
    In(Vec<Value>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    pub column: Column,
    pub op: PredicateOp,
}

impl Predicate {
    fn parse(column: &str, op: &str, literal: &serde_json::Value) -> Result<Self> {
        let column = resolve_column(column)?;
        let kind = column.kind();
        let scalar = |v: &serde_json::Value| Value::from_json(kind, v);
        let op = match op.to_ascii_lowercase().as_str() {
            "eq" | "=" | "==" => PredicateOp::Eq(scalar(literal)?),
            "neq" | "ne" | "!=" | "<>" => PredicateOp::Neq(scalar(literal)?),
            "lt" | "<" => PredicateOp::Lt(scalar(literal)?),
            "lte" | "le" | "<=" => PredicateOp::Lte(scalar(literal)?),
            "gt" | ">" => PredicateOp::Gt(scalar(literal)?),
            "gte" | "ge" | ">=" => PredicateOp::Gte(scalar(literal)?),
            "between" => match literal.as_array().map(Vec::as_slice) {
                Some([lo, hi]) => PredicateOp::Between(scalar(lo)?, scalar(hi)?),
                _ => {
                    return Err(EngineError::query(format!(
                        "between on '{}' needs a [low, high] pair",
                        column
                    )))
                }
            },
            "in" => match literal.as_array() {
                Some(values) => {
                    let mut values = values.iter().map(scalar).collect::<Result<Vec<_>>>()?;
                    values.sort();
                    values.dedup();
                    PredicateOp::In(values)
                }
                None => {
                    return Err(EngineError::query(format!(
                        "in on '{}' needs a list",
                        column
                    )))
                }
            },
            other => {
                return Err(EngineError::query(format!(
                    "unsupported operator '{}'",
                    other
                )))
            }
        };
        Ok(Self { column, op })
    }

    /// SQL three-valued logic collapsed to false: NULL never matches.
    pub fn matches(&self, value: &Value) -> bool {
        if value.is_null() {
            return false;
        }
        let known = |lit: &Value| !lit.is_null();
        match &self.op {
            PredicateOp::Eq(lit) => known(lit) && value == lit,
            PredicateOp::Neq(lit) => known(lit) && value != lit,
            PredicateOp::Lt(lit) => known(lit) && value < lit,
            PredicateOp::Lte(lit) => known(lit) && value <= lit,
            PredicateOp::Gt(lit) => known(lit) && value > lit,
            PredicateOp::Gte(lit) => known(lit) && value >= lit,
            PredicateOp::Between(lo, hi) => known(lo) && known(hi) && lo <= value && value <= hi,
            PredicateOp::In(values) => values.iter().any(|lit| known(lit) && value == lit),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = self.column;
        match &self.op {
            PredicateOp::Eq(v) => write!(f, "{} = {}", c, v.to_literal()),
            PredicateOp::Neq(v) => write!(f, "{} <> {}", c, v.to_literal()),
            PredicateOp::Lt(v) => write!(f, "{} < {}", c, v.to_literal()),
            PredicateOp::Lte(v) => write!(f, "{} <= {}", c, v.to_literal()),
            PredicateOp::Gt(v) => write!(f, "{} > {}", c, v.to_literal()),
            PredicateOp::Gte(v) => write!(f, "{} >= {}", c, v.to_literal()),
            PredicateOp::Between(lo, hi) => write!(
                f,
                "{} BETWEEN {} AND {}",
                c,
                lo.to_literal(),
                hi.to_literal()
            ),
            PredicateOp::In(values) => {
                let list: Vec<String> = values.iter().map(Value::to_literal).collect();
                write!(f, "{} IN ({})", c, list.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    /// Output column name.
    pub key: String,
    pub descending: bool,
}

/// Canonical identity of a query, independent of its id and of filter order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QuerySignature(String);

impl QuerySignature {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QuerySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated query over the `events` table.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub id: String,
    pub select: Vec<SelectItem>,
    pub filters: Vec<Predicate>,
    pub group_by: Vec<Column>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
}

impl QueryRequest {
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawQuery = serde_json::from_str(text)
            .map_err(|e| EngineError::query(format!("invalid query JSON: {}", e)))?;
        raw.into_request("q1")
    }

    /// Parse a JSON array of queries, or an object with a `queries` array.
    /// Queries without an id are labelled `q<N>` by position.
    pub fn parse_list(text: &str) -> Result<Vec<Self>> {
        let raw: RawQueryList = serde_json::from_str(text)
            .map_err(|e| EngineError::query(format!("invalid query list JSON: {}", e)))?;
        let queries = match raw {
            RawQueryList::List(queries) | RawQueryList::Wrapped { queries } => queries,
        };
        queries
            .into_iter()
            .enumerate()
            .map(|(i, raw)| raw.into_request(&format!("q{}", i + 1)))
            .collect()
    }

    pub fn aggregates(&self) -> Vec<AggregateExpr> {
        self.select
            .iter()
            .filter_map(|item| match item {
                SelectItem::Aggregate(agg) => Some(*agg),
                SelectItem::Column(_) => None,
            })
            .collect()
    }

    /// Grouped queries produce one row per group; the rest project rows.
    pub fn is_grouped(&self) -> bool {
        !self.group_by.is_empty() || !self.aggregates().is_empty()
    }

    pub fn output_columns(&self) -> Vec<String> {
        self.select.iter().map(SelectItem::output_name).collect()
    }

    /// Every event column the query reads.
    pub fn referenced_columns(&self) -> BTreeSet<Column> {
        let mut columns: BTreeSet<Column> = self.group_by.iter().copied().collect();
        columns.extend(self.filters.iter().map(|p| p.column));
        for item in &self.select {
            match item {
                SelectItem::Column(c) => {
                    columns.insert(*c);
                }
                SelectItem::Aggregate(agg) => columns.extend(agg.column),
            }
        }
        columns
    }

    pub fn filters_on(&self, column: Column) -> impl Iterator<Item = &Predicate> {
        self.filters.iter().filter(move |p| p.column == column)
    }

    /// Event types admitted by the type predicates, or `None` without any.
    pub fn event_types(&self) -> Option<BTreeSet<EventType>> {
        let mut predicates = self.filters_on(Column::Type).peekable();
        predicates.peek()?;
        let admitted = predicates.fold(
            EventType::ALL.into_iter().collect::<BTreeSet<_>>(),
            |mut types, p| {
                types.retain(|t| p.matches(&Value::Str(t.as_str().to_string())));
                types
            },
        );
        Some(admitted)
    }

    pub fn signature(&self) -> QuerySignature {
        let mut filters: Vec<String> = self.filters.iter().map(|p| p.to_string()).collect();
        filters.sort();
        filters.dedup();
        QuerySignature(self.render(&filters))
    }

    fn render(&self, filters: &[String]) -> String {
        let mut sql = format!("SELECT {} FROM events", self.output_columns().join(", "));
        if !filters.is_empty() {
            sql.push_str(&format!(" WHERE {}", filters.join(" AND ")));
        }
        if !self.group_by.is_empty() {
            let keys: Vec<&str> = self.group_by.iter().map(Column::name).collect();
            sql.push_str(&format!(" GROUP BY {}", keys.join(", ")));
        }
        if !self.order_by.is_empty() {
            let keys: Vec<String> = self
                .order_by
                .iter()
                .map(|o| format!("{} {}", o.key, if o.descending { "DESC" } else { "ASC" }))
                .collect();
            sql.push_str(&format!(" ORDER BY {}", keys.join(", ")));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        sql
    }

    fn validate(&self) -> Result<()> {
        if self.select.is_empty() {
            return Err(EngineError::query(format!("{}: empty select list", self.id)));
        }
        if self.is_grouped() {
            for item in &self.select {
                if let SelectItem::Column(c) = item {
                    if !self.group_by.contains(c) {
                        return Err(EngineError::query(format!(
                            "{}: column '{}' must appear in group_by or inside an aggregate",
                            self.id, c
                        )));
                    }
                }
            }
        }
        let outputs = self.output_columns();
        for order in &self.order_by {
            if !outputs.contains(&order.key) {
                return Err(EngineError::query(format!(
                    "{}: cannot order by '{}', not in the select list",
                    self.id, order.key
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for QueryRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let filters: Vec<String> = self.filters.iter().map(|p| p.to_string()).collect();
        f.write_str(&self.render(&filters))
    }
}

/// The five canned queries shipped with the crate.
pub fn default_queries() -> Result<Vec<QueryRequest>> {
    QueryRequest::parse_list(include_str!("../queries/default.json"))
}

fn resolve_column(name: &str) -> Result<Column> {
    Column::from_name(name.trim())
        .ok_or_else(|| EngineError::query(format!("unknown column '{}'", name)))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawQueryList {
    List(Vec<RawQuery>),
    Wrapped { queries: Vec<RawQuery> },
}

#[derive(Deserialize)]
struct RawQuery {
    #[serde(default, alias = "queryId", alias = "query_id")]
    id: Option<String>,
    #[serde(default)]
    select: Vec<RawSelect>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default, rename = "where", alias = "filters")]
    filters: Option<RawFilters>,
    #[serde(default, alias = "groupBy")]
    group_by: Vec<String>,
    #[serde(default, alias = "orderBy")]
    order_by: Vec<RawOrder>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    aggregate: Option<RawAggregates>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSelect {
    Column(String),
    Aggregate(BTreeMap<String, String>),
}

#[derive(Deserialize)]
struct RawPredicate {
    #[serde(alias = "column")]
    col: String,
    op: String,
    #[serde(default, alias = "value")]
    val: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawFilters {
    List(Vec<RawPredicate>),
    Map(BTreeMap<String, serde_json::Value>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawOrder {
    Key(String),
    Spec {
        col: String,
        #[serde(default)]
        dir: Option<String>,
    },
}

#[derive(Deserialize)]
struct RawAggregate {
    field: String,
    #[serde(rename = "fn", alias = "func")]
    func: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawAggregates {
    One(RawAggregate),
    Many(Vec<RawAggregate>),
}

impl RawQuery {
    fn into_request(self, default_id: &str) -> Result<QueryRequest> {
        let id = self.id.unwrap_or_else(|| default_id.to_string());
        if let Some(from) = &self.from {
            if from != "events" {
                return Err(EngineError::query(format!(
                    "{}: unknown table '{}'",
                    id, from
                )));
            }
        }
        let context = |e: EngineError| match e {
            EngineError::Query(msg) => EngineError::Query(format!("{}: {}", id, msg)),
            other => other,
        };

        let group_by = self
            .group_by
            .iter()
            .map(|name| resolve_column(name))
            .collect::<Result<Vec<_>>>()
            .map_err(context)?;

        let mut select = Vec::new();
        for item in self.select {
            match item {
                RawSelect::Column(name) => {
                    select.push(SelectItem::Column(resolve_column(&name).map_err(context)?))
                }
                RawSelect::Aggregate(map) => {
                    for (func, column) in map {
                        let func = AggFunc::parse(&func).map_err(context)?;
                        let agg = AggregateExpr::new(func, &column).map_err(context)?;
                        select.push(SelectItem::Aggregate(agg));
                    }
                }
            }
        }
        let extra_aggregates = match self.aggregate {
            None => Vec::new(),
            Some(RawAggregates::One(a)) => vec![a],
            Some(RawAggregates::Many(list)) => list,
        };
        if select.is_empty() {
            select.extend(group_by.iter().copied().map(SelectItem::Column));
        }
        for raw in extra_aggregates {
            let func = AggFunc::parse(&raw.func).map_err(context)?;
            let agg = AggregateExpr::new(func, &raw.field).map_err(context)?;
            select.push(SelectItem::Aggregate(agg));
        }

        let filters = match self.filters {
            None => Vec::new(),
            Some(RawFilters::List(list)) => list
                .iter()
                .map(|p| Predicate::parse(&p.col, &p.op, &p.val))
                .collect::<Result<Vec<_>>>()
                .map_err(context)?,
            Some(RawFilters::Map(map)) => map
                .iter()
                .map(|(key, value)| filter_from_entry(key, value))
                .collect::<Result<Vec<_>>>()
                .map_err(context)?,
        };

        let order_by = self
            .order_by
            .into_iter()
            .map(|raw| match raw {
                RawOrder::Key(key) => Ok(OrderBy {
                    key,
                    descending: false,
                }),
                RawOrder::Spec { col, dir } => {
                    let descending = match dir.as_deref().map(str::to_ascii_lowercase) {
                        None => false,
                        Some(d) if d == "asc" => false,
                        Some(d) if d == "desc" => true,
                        Some(d) => {
                            return Err(EngineError::query(format!(
                                "{}: unknown sort direction '{}'",
                                id, d
                            )))
                        }
                    };
                    Ok(OrderBy {
                        key: col,
                        descending,
                    })
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let request = QueryRequest {
            id,
            select,
            filters,
            group_by,
            order_by,
            limit: self.limit,
        };
        request.validate()?;
        Ok(request)
    }
}

/// One entry of the compact filter object.
fn filter_from_entry(key: &str, value: &serde_json::Value) -> Result<Predicate> {
    if key == "dateRange" || key == "date_range" {
        let bounds = match value {
            serde_json::Value::Array(pair) => pair.clone(),
            serde_json::Value::Object(map) => {
                let pick = |names: [&str; 2]| {
                    names
                        .iter()
                        .find_map(|n| map.get(*n).cloned())
                        .unwrap_or(serde_json::Value::Null)
                };
                vec![pick(["from", "start"]), pick(["to", "end"])]
            }
            _ => Vec::new(),
        };
        return Predicate::parse("day", "between", &serde_json::Value::Array(bounds));
    }
    let op = if value.is_array() { "in" } else { "eq" };
    Predicate::parse(key, op, value)
}
