// =============================================================================
// Symbol Catalog — per-account symbol list and metadata cache
// =============================================================================
//
// After account auth the catalog fetches the broker's symbols list (name/id
// pairs) once, then resolves digits and pip position per symbol on demand via
// symbol-by-id requests. Entries live for the lifetime of the broker session;
// a reconnect invalidates everything and in-flight fetches fail over to their
// callers for retry.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::broker::BrokerSession;
use crate::codec::messages::{
    ProtoOaSymbolByIdReq, ProtoOaSymbolByIdRes, ProtoOaSymbolsListReq, ProtoOaSymbolsListRes,
};
use crate::error::CatalogError;
use crate::types::SymbolInfo;

pub struct SymbolCatalog {
    session: Arc<BrokerSession>,

    /// Fully resolved metadata, keyed both ways.
    by_name: RwLock<HashMap<String, Arc<SymbolInfo>>>,
    by_id: RwLock<HashMap<i64, Arc<SymbolInfo>>>,

    /// Name -> id pairs from the symbols-list response; `None` until the
    /// first fetch (or after invalidation).
    names: RwLock<Option<HashMap<String, i64>>>,

    /// Serializes broker fetches so concurrent `ensure_metadata` calls do not
    /// duplicate the symbols-list request.
    fetch_lock: tokio::sync::Mutex<()>,
}

impl SymbolCatalog {
    pub fn new(session: Arc<BrokerSession>) -> Self {
        Self {
            session,
            by_name: RwLock::new(HashMap::new()),
            by_id: RwLock::new(HashMap::new()),
            names: RwLock::new(None),
            fetch_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Cache-only lookup by name. Use [`ensure_metadata`] to populate.
    pub fn resolve_name(&self, name: &str) -> Option<Arc<SymbolInfo>> {
        self.by_name.read().get(&canonical(name)).cloned()
    }

    /// Cache-only lookup by broker id.
    pub fn resolve_id(&self, id: i64) -> Option<Arc<SymbolInfo>> {
        self.by_id.read().get(&id).cloned()
    }

    /// All fully resolved symbols, sorted by name. Feeds the gateway's
    /// `symbolList` message and the REST mirror.
    pub fn known_symbols(&self) -> Vec<Arc<SymbolInfo>> {
        let mut symbols: Vec<Arc<SymbolInfo>> =
            self.by_name.read().values().cloned().collect();
        symbols.sort_by(|a, b| a.name.cmp(&b.name));
        symbols
    }

    /// True when a symbol name is at least listed for the account, even if
    /// its metadata has not been fetched yet.
    pub fn is_listed(&self, name: &str) -> Option<bool> {
        self.names
            .read()
            .as_ref()
            .map(|names| names.contains_key(&canonical(name)))
    }

    /// Resolve a symbol's metadata, fetching from the broker as needed.
    /// Suspends until resolved; concurrent callers share the underlying
    /// broker requests.
    pub async fn ensure_metadata(&self, name: &str) -> Result<Arc<SymbolInfo>, CatalogError> {
        let name = canonical(name);

        if let Some(info) = self.by_name.read().get(&name).cloned() {
            return Ok(info);
        }

        let _guard = self.fetch_lock.lock().await;

        // A concurrent caller may have resolved it while we waited.
        if let Some(info) = self.by_name.read().get(&name).cloned() {
            return Ok(info);
        }

        let id = match self.lookup_id(&name).await? {
            Some(id) => id,
            None => return Err(CatalogError::NotFound(name)),
        };

        let info = self.fetch_symbol(id, &name).await?;
        self.by_name.write().insert(name.clone(), info.clone());
        self.by_id.write().insert(id, info.clone());
        debug!(symbol = %info.name, id = info.id, digits = info.digits, pip_position = info.pip_position, "symbol metadata cached");
        Ok(info)
    }

    /// Drop every cached entry. Called when the broker session drops; the
    /// next `ensure_metadata` refetches against the new session.
    pub fn invalidate(&self) {
        let had = self.by_name.read().len();
        self.by_name.write().clear();
        self.by_id.write().clear();
        *self.names.write() = None;
        if had > 0 {
            info!(entries = had, "symbol catalog invalidated");
        }
    }

    // ── Broker fetches (fetch_lock held) ────────────────────────────────

    async fn lookup_id(&self, name: &str) -> Result<Option<i64>, CatalogError> {
        if let Some(names) = self.names.read().as_ref() {
            return Ok(names.get(name).copied());
        }

        let req = ProtoOaSymbolsListReq {
            ctid_trader_account_id: self.session.account_id(),
            include_archived_symbols: Some(false),
        };
        let res: ProtoOaSymbolsListRes = self.session.request(&req).await.map_err(CatalogError::Session)?;

        let mut names = HashMap::with_capacity(res.symbol.len());
        for light in &res.symbol {
            if let Some(symbol_name) = &light.symbol_name {
                names.insert(canonical(symbol_name), light.symbol_id);
            }
        }
        info!(count = names.len(), "symbols list fetched");

        let id = names.get(name).copied();
        *self.names.write() = Some(names);
        Ok(id)
    }

    async fn fetch_symbol(&self, id: i64, name: &str) -> Result<Arc<SymbolInfo>, CatalogError> {
        let req = ProtoOaSymbolByIdReq {
            ctid_trader_account_id: self.session.account_id(),
            symbol_id: vec![id],
        };
        let res: ProtoOaSymbolByIdRes = self.session.request(&req).await.map_err(CatalogError::Session)?;

        let detail = res
            .symbol
            .iter()
            .find(|s| s.symbol_id == id)
            .ok_or_else(|| {
                warn!(symbol = %name, id, "symbol-by-id response missing requested symbol");
                CatalogError::NotFound(name.to_string())
            })?;

        Ok(Arc::new(SymbolInfo {
            id,
            name: name.to_string(),
            digits: detail.digits,
            pip_position: detail.pip_position,
        }))
    }
}

fn canonical(name: &str) -> String {
    name.trim().to_uppercase()
}
