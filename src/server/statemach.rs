//! Local storage collaborator: replicated write operation types, the abstract
//! apply interface the ordering engine delivers into, and an in-memory
//! marketplace table store implementing it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use crate::utils::OrdercastError;

use async_trait::async_trait;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Mutating database operations that go through the ordering protocol. Read
/// operations never enter the protocol and so have no variant here.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
pub enum OpsType {
    CreateBuyer,
    UpdateBuyerById,
    CreateSeller,
    UpdateSellerById,
    CreateCart,
    UpdateCartById,
    DeleteCartById,
    CreateCartItem,
    UpdateCartItem,
    DeleteCartItemByCartIdAndProductId,
    DeleteCartItemByCartId,
    DeleteCartItemByProductId,
    CreateSession,
    DeleteSessionById,
    CreateTransaction,
    DeleteTransactionsByCartId,
    DeleteTransactionsByBuyerId,
    DeleteTransactionsBySellerId,
    CreateProduct,
    UpdateProductById,
    DeleteProductById,
}

/// Storage tables touched by write operations.
#[derive(
    Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Clone, Copy, Serialize, Deserialize,
)]
pub enum Table {
    Buyers,
    Sellers,
    Carts,
    CartItems,
    Sessions,
    Transactions,
    Products,
}

/// How an operation mutates its table.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Action {
    /// Insert (or overwrite) the record keyed by the payload's key fields.
    Insert,
    /// Merge payload fields into an existing record; no-op if absent.
    Merge,
    /// Remove the record keyed by the payload's key fields.
    Remove,
    /// Remove every record whose given field equals the payload's.
    RemoveWhere(&'static str),
}

impl OpsType {
    /// All operation types, in declaration order.
    pub const ALL: [OpsType; 21] = [
        OpsType::CreateBuyer,
        OpsType::UpdateBuyerById,
        OpsType::CreateSeller,
        OpsType::UpdateSellerById,
        OpsType::CreateCart,
        OpsType::UpdateCartById,
        OpsType::DeleteCartById,
        OpsType::CreateCartItem,
        OpsType::UpdateCartItem,
        OpsType::DeleteCartItemByCartIdAndProductId,
        OpsType::DeleteCartItemByCartId,
        OpsType::DeleteCartItemByProductId,
        OpsType::CreateSession,
        OpsType::DeleteSessionById,
        OpsType::CreateTransaction,
        OpsType::DeleteTransactionsByCartId,
        OpsType::DeleteTransactionsByBuyerId,
        OpsType::DeleteTransactionsBySellerId,
        OpsType::CreateProduct,
        OpsType::UpdateProductById,
        OpsType::DeleteProductById,
    ];

    /// Parse operation name string into `OpsType`.
    pub fn parse_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .find(|ops| format!("{:?}", ops) == name)
            .copied()
    }

    /// Table this operation writes to.
    pub fn table(&self) -> Table {
        self.plan().0
    }

    fn plan(&self) -> (Table, Action) {
        use OpsType::*;
        match self {
            CreateBuyer => (Table::Buyers, Action::Insert),
            UpdateBuyerById => (Table::Buyers, Action::Merge),
            CreateSeller => (Table::Sellers, Action::Insert),
            UpdateSellerById => (Table::Sellers, Action::Merge),
            CreateCart => (Table::Carts, Action::Insert),
            UpdateCartById => (Table::Carts, Action::Merge),
            DeleteCartById => (Table::Carts, Action::Remove),
            CreateCartItem => (Table::CartItems, Action::Insert),
            UpdateCartItem => (Table::CartItems, Action::Merge),
            DeleteCartItemByCartIdAndProductId => {
                (Table::CartItems, Action::Remove)
            }
            DeleteCartItemByCartId => {
                (Table::CartItems, Action::RemoveWhere("cart_id"))
            }
            DeleteCartItemByProductId => {
                (Table::CartItems, Action::RemoveWhere("product_id"))
            }
            CreateSession => (Table::Sessions, Action::Insert),
            DeleteSessionById => (Table::Sessions, Action::Remove),
            CreateTransaction => (Table::Transactions, Action::Insert),
            DeleteTransactionsByCartId => {
                (Table::Transactions, Action::RemoveWhere("cart_id"))
            }
            DeleteTransactionsByBuyerId => {
                (Table::Transactions, Action::RemoveWhere("buyer_id"))
            }
            DeleteTransactionsBySellerId => {
                (Table::Transactions, Action::RemoveWhere("seller_id"))
            }
            CreateProduct => (Table::Products, Action::Insert),
            UpdateProductById => (Table::Products, Action::Merge),
            DeleteProductById => (Table::Products, Action::Remove),
        }
    }
}

impl FromStr for OpsType {
    type Err = OrdercastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_name(s).ok_or_else(|| OrdercastError::UnknownOps(s.into()))
    }
}

impl fmt::Display for OpsType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Table {
    /// Parse table name string (e.g., "cart_items") into `Table`.
    pub fn parse_name(name: &str) -> Option<Self> {
        match name {
            "buyers" => Some(Self::Buyers),
            "sellers" => Some(Self::Sellers),
            "carts" => Some(Self::Carts),
            "cart_items" => Some(Self::CartItems),
            "sessions" => Some(Self::Sessions),
            "transactions" => Some(Self::Transactions),
            "products" => Some(Self::Products),
            _ => None,
        }
    }

    /// Fields whose values together form a record's key.
    fn key_fields(&self) -> &'static [&'static str] {
        match self {
            Table::CartItems => &["cart_id", "product_id"],
            _ => &["id"],
        }
    }
}

/// A stored record: a flat JSON object of entity field values.
pub type Record = Map<String, Value>;

/// Renders a scalar field value as key text. Strings are used verbatim so
/// that `"7"` and `7` address the same record.
fn key_part(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Computes the key of a record in given table from its fields.
pub fn record_key(table: Table, record: &Record) -> Result<String, OrdercastError> {
    let mut parts = Vec::with_capacity(2);
    for field in table.key_fields() {
        match record.get(*field).and_then(key_part) {
            Some(part) => parts.push(part),
            None => {
                return Err(OrdercastError::msg(format!(
                    "missing key field '{}' for table {:?}",
                    field, table
                )))
            }
        }
    }
    Ok(parts.join("/"))
}

/// Decodes and checks an operation payload. Called at submission time so
/// that a payload which cannot possibly apply never gets globally ordered.
pub fn validate_payload(
    ops: OpsType,
    payload: &[u8],
) -> Result<Record, OrdercastError> {
    let record: Record = serde_json::from_slice(payload)?;
    let (table, action) = ops.plan();
    match action {
        Action::RemoveWhere(field) => {
            if record.get(field).and_then(key_part).is_none() {
                return Err(OrdercastError::msg(format!(
                    "{} payload lacks field '{}'",
                    ops, field
                )));
            }
        }
        _ => {
            record_key(table, &record)?;
        }
    }
    Ok(record)
}

/// Abstract apply interface: invoked exactly once per delivered operation, in
/// global delivery order.
#[async_trait]
pub trait Applier: Send + 'static {
    /// Applies the operation to local storage.
    async fn apply(
        &mut self,
        ops: OpsType,
        payload: &[u8],
    ) -> Result<(), OrdercastError>;
}

type Tables = HashMap<Table, BTreeMap<String, Record>>;

/// In-memory marketplace storage. Cloning yields another handle to the same
/// tables, so the service layer can serve reads while the ordering engine
/// owns the write path.
#[derive(Debug, Clone, Default)]
pub struct MarketStore {
    tables: Arc<RwLock<Tables>>,
}

impl MarketStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Executes a write operation on the tables.
    pub fn execute(
        &self,
        ops: OpsType,
        payload: &[u8],
    ) -> Result<(), OrdercastError> {
        let record = validate_payload(ops, payload)?;
        let (table, action) = ops.plan();

        let mut tables = self
            .tables
            .write()
            .map_err(|_| OrdercastError::msg("store lock poisoned"))?;
        let rows = tables.entry(table).or_default();

        match action {
            Action::Insert => {
                let key = record_key(table, &record)?;
                rows.insert(key, record);
            }
            Action::Merge => {
                let key = record_key(table, &record)?;
                if let Some(row) = rows.get_mut(&key) {
                    row.extend(record);
                }
            }
            Action::Remove => {
                let key = record_key(table, &record)?;
                rows.remove(&key);
            }
            Action::RemoveWhere(field) => {
                let target = record.get(field).and_then(key_part);
                rows.retain(|_, row| row.get(field).and_then(key_part) != target);
            }
        }

        Ok(())
    }

    /// Reads a record by key.
    pub fn get(&self, table: Table, key: &str) -> Option<Record> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.get(&table).and_then(|rows| rows.get(key)).cloned()
    }

    /// Number of records currently in given table.
    pub fn count(&self, table: Table) -> usize {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.get(&table).map_or(0, |rows| rows.len())
    }

    /// Full ordered copy of all non-empty tables, for comparing replicas.
    pub fn snapshot(&self) -> BTreeMap<Table, BTreeMap<String, Record>> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(table, rows)| (*table, rows.clone()))
            .collect()
    }
}

#[async_trait]
impl Applier for MarketStore {
    async fn apply(
        &mut self,
        ops: OpsType,
        payload: &[u8],
    ) -> Result<(), OrdercastError> {
        self.execute(ops, payload)
    }
}
