//! The traced marker families.
//!
//! A family is a small list of related platform types whose methods share one
//! provenance scheme. The default list covers the JDBC driver surface plus the
//! two types the runtime filter needs to see through proxies.

use crate::hierarchy::OBJECT;

pub const DATA_SOURCE: &str = "javax/sql/DataSource";
pub const XA_DATA_SOURCE: &str = "javax/sql/XADataSource";
pub const STATEMENT: &str = "java/sql/Statement";
pub const PREPARED_STATEMENT: &str = "java/sql/PreparedStatement";
pub const CALLABLE_STATEMENT: &str = "java/sql/CallableStatement";
pub const CONNECTION: &str = "java/sql/Connection";
pub const POOLED_CONNECTION: &str = "javax/sql/PooledConnection";
pub const XA_CONNECTION: &str = "javax/sql/XAConnection";
pub const INVOCATION_HANDLER: &str = "java/lang/reflect/InvocationHandler";
pub const XA_RESOURCE: &str = "javax/transaction/xa/XAResource";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Family {
    pub name: String,
    pub members: Vec<String>,
    /// Family whose implementations also get every public constructor and
    /// non-inherited public method traced.
    pub blanket: bool,
}

impl Family {
    pub fn new(name: &str, members: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            members: members.iter().map(|m| m.to_string()).collect(),
            blanket: false,
        }
    }

    pub fn blanket(mut self) -> Self {
        self.blanket = true;
        self
    }
}

/// The six families in the order marks are assigned.
pub fn default_families() -> Vec<Family> {
    vec![
        Family::new("pooled-connection", &[XA_CONNECTION, POOLED_CONNECTION]),
        Family::new("connection", &[CONNECTION]),
        Family::new("statement", &[CALLABLE_STATEMENT, PREPARED_STATEMENT, STATEMENT]),
        Family::new("data-source", &[DATA_SOURCE, XA_DATA_SOURCE]).blanket(),
        Family::new("invocation-handler", &[INVOCATION_HANDLER]),
        Family::new("xa-resource", &[XA_RESOURCE]),
    ]
}

/// Seed list for the platform closure: the root type, then every family
/// member. Blanket families go first so their stubs are fetched early.
pub fn closure_seeds(families: &[Family], root: &str) -> Vec<String> {
    let mut seeds = vec![root.to_string()];
    let ordered = families.iter().filter(|f| f.blanket).chain(families.iter().filter(|f| !f.blanket));
    for family in ordered {
        for member in &family.members {
            if !seeds.contains(member) {
                seeds.push(member.clone());
            }
        }
    }
    seeds
}

pub fn default_seeds() -> Vec<String> {
    closure_seeds(&default_families(), OBJECT)
}
