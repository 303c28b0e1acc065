//! Message router
//!
//! Single dispatch loop for every inbound channel. Synchronous operations
//! are answered inline; anything that waits on a backend, the file system,
//! the cookie jar or another context is spawned so the loop keeps draining.
//! A message whose channel is unknown, whose session does not match the
//! sender's, or whose payload does not validate is logged and dropped.

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{AbortHandle, JoinHandle};

use extbus_privacy::Blacklist;
use extbus_session::{ContextId, ExtensionRuntime, SessionId, SessionRegistry, WindowId};
use extbus_storage::{Database, MemoryBackend, SqliteBackend};

use crate::alarms::AlarmScheduler;
use crate::channel::{storage_response_channel, tabs_create_response_channel, ChannelName, ChannelScope};
use crate::config::BusConfig;
use crate::contexts::{ContextInfo, ContextKind, ContextTable};
use crate::cookies::{Cookie, CookieChange, CookieDetails, CookieFanout, CookieStore};
use crate::error::BusError;
use crate::host::HostDelegate;
use crate::messaging::Messenger;
use crate::ports::PortManager;
use crate::protocol::{
    ContextEvent, Inbound, InjectRequest, Reply, Request, StorageRequest, TabsCreateRequest,
};
use crate::snapshot::BackgroundSerializer;
use crate::storage::{StorageProxy, StorageReply};
use crate::Result;

/// What an attached context gets back: its id, its inbox and a handle for
/// talking to the router
pub struct ContextEndpoint {
    pub id: ContextId,
    pub session_id: SessionId,
    pub info: ContextInfo,
    pub inbox: mpsc::UnboundedReceiver<ContextEvent>,
    pub outbound: mpsc::UnboundedSender<Inbound>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InjectKind {
    Css,
    Script,
}

#[derive(Clone)]
pub struct MessageRouter {
    config: Arc<BusConfig>,
    registry: SessionRegistry,
    contexts: ContextTable,
    ports: PortManager,
    messenger: Messenger,
    storage: StorageProxy,
    alarms: AlarmScheduler,
    cookies: CookieFanout,
    cookie_stores: Arc<RwLock<HashMap<SessionId, Arc<dyn CookieStore>>>>,
    cookie_watchers: Arc<Mutex<HashMap<SessionId, AbortHandle>>>,
    serializer: BackgroundSerializer,
    host: Arc<dyn HostDelegate>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>>,
}

impl MessageRouter {
    pub fn new(config: BusConfig, storage: StorageProxy, host: Arc<dyn HostDelegate>) -> Self {
        let registry = SessionRegistry::new();
        let contexts = ContextTable::new();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        Self {
            messenger: Messenger::new(registry.clone(), contexts.clone()),
            alarms: AlarmScheduler::new(registry.clone(), contexts.clone(), &config),
            serializer: BackgroundSerializer::new(config.snapshot_timeout()),
            ports: PortManager::new(),
            cookies: CookieFanout::new(),
            cookie_stores: Arc::new(RwLock::new(HashMap::new())),
            cookie_watchers: Arc::new(Mutex::new(HashMap::new())),
            config: Arc::new(config),
            registry,
            contexts,
            storage,
            host,
            inbound_tx,
            inbound_rx: Arc::new(Mutex::new(Some(inbound_rx))),
        }
    }

    /// Router backed by the SQLite database named in the config
    pub fn open(config: BusConfig, host: Arc<dyn HostDelegate>) -> Result<Self> {
        config.validate()?;
        if let Some(parent) = config.database_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::open(&config.database_path)?;

        tracing::info!(path = %config.database_path.display(), "Opened extension storage");

        let storage = StorageProxy::new(
            Arc::new(SqliteBackend::new(db)),
            Arc::new(MemoryBackend::new()),
        );
        Ok(Self::new(config, storage, host))
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn contexts(&self) -> &ContextTable {
        &self.contexts
    }

    pub fn ports(&self) -> &PortManager {
        &self.ports
    }

    pub fn alarms(&self) -> &AlarmScheduler {
        &self.alarms
    }

    pub fn cookies(&self) -> &CookieFanout {
        &self.cookies
    }

    /// Handle for sending inbound messages from outside a context endpoint
    pub fn sender(&self) -> mpsc::UnboundedSender<Inbound> {
        self.inbound_tx.clone()
    }

    // ==================== Sessions ====================

    /// Register a session with its blacklist and cookie jar. When called
    /// inside a tokio runtime, the jar's change feed is forwarded to
    /// `cookies.onChanged` subscribers.
    pub fn start_session(
        &self,
        session_id: SessionId,
        blacklist: Blacklist,
        cookie_store: Arc<dyn CookieStore>,
    ) -> Result<()> {
        self.registry.start_session(session_id, blacklist)?;

        if let Some(changes) = cookie_store.changes() {
            if let Some(watcher) = self.watch_cookies(session_id, changes) {
                self.cookie_watchers.lock().insert(session_id, watcher);
            }
        }
        self.cookie_stores.write().insert(session_id, cookie_store);

        Ok(())
    }

    pub fn end_session(&self, session_id: SessionId) -> Result<()> {
        self.registry.end_session(session_id)?;

        let dropped = self.contexts.drop_session(session_id);
        self.ports.drop_session(session_id);
        self.alarms.drop_session(session_id);
        self.cookies.drop_session(session_id);
        self.serializer.drop_session(session_id);
        self.cookie_stores.write().remove(&session_id);
        if let Some(watcher) = self.cookie_watchers.lock().remove(&session_id) {
            watcher.abort();
        }

        tracing::debug!(session_id, contexts = dropped, "Session torn down");

        Ok(())
    }

    pub fn load_extension(&self, session_id: SessionId, extension: ExtensionRuntime) -> Result<()> {
        Ok(self.registry.load_extension(session_id, extension)?)
    }

    pub fn unload_extension(&self, session_id: SessionId, extension_id: &str) -> Result<()> {
        self.alarms.drop_extension(session_id, extension_id);
        self.registry.unload_extension(session_id, extension_id)?;
        Ok(())
    }

    pub fn resolve_extension(&self, session_id: SessionId, extension_id: &str) -> Result<ExtensionRuntime> {
        Ok(self.registry.extension(session_id, extension_id)?)
    }

    // ==================== Contexts ====================

    /// Attach a context to a session. A background page becomes its
    /// extension's background handle.
    pub fn attach_context(&self, session_id: SessionId, info: ContextInfo) -> Result<ContextEndpoint> {
        if !self.registry.contains(session_id) {
            return Err(BusError::NotFound(format!("session {}", session_id)));
        }

        let (id, inbox) = self.contexts.attach(session_id, info.clone());

        if info.kind == ContextKind::BackgroundPage {
            let extension_id = info.extension_id.as_deref().unwrap_or_default();
            if let Err(e) = self.registry.set_background(session_id, extension_id, Some(id)) {
                self.contexts.detach(id);
                return Err(e.into());
            }
        }

        Ok(ContextEndpoint {
            id,
            session_id,
            info,
            inbox,
            outbound: self.inbound_tx.clone(),
        })
    }

    /// Forget a destroyed context. Ports it opened are dropped and a
    /// background handle pointing at it is cleared; cookie subscriptions
    /// are left to fail as stale.
    pub fn detach_context(&self, id: ContextId) -> Option<ContextInfo> {
        let (session_id, info) = self.contexts.detach(id)?;

        let ports = self.ports.drop_context(session_id, id);
        if info.kind == ContextKind::BackgroundPage {
            if let Err(e) = self.registry.release_background(session_id, id) {
                tracing::debug!(session_id, context = %id, error = %e, "Could not release background");
            }
        }

        tracing::debug!(session_id, context = %id, dropped_ports = ports.len(), "Context destroyed");

        Some(info)
    }

    // ==================== Dispatch ====================

    /// Start the dispatch loop on the current runtime
    pub fn spawn(&self) -> Result<JoinHandle<()>> {
        let rx = self
            .inbound_rx
            .lock()
            .take()
            .ok_or(BusError::AlreadyRunning)?;
        let router = self.clone();
        Ok(tokio::spawn(router.serve(rx)))
    }

    pub async fn serve(self, mut rx: mpsc::UnboundedReceiver<Inbound>) {
        tracing::info!("Message router started");

        while let Some(inbound) = rx.recv().await {
            self.dispatch(inbound);
        }

        tracing::info!("Message router stopped");
    }

    pub fn dispatch(&self, inbound: Inbound) {
        let Inbound {
            channel,
            sender,
            payload,
            reply,
        } = inbound;

        let Some(name) = ChannelName::parse(&channel) else {
            tracing::debug!(channel = %channel, "Ignoring unknown channel");
            return;
        };

        let Some(session_id) = self.contexts.session_of(sender) else {
            tracing::debug!(channel = %channel, context = %sender, "Ignoring message from unknown context");
            return;
        };

        if let ChannelScope::Session(scoped) = name.scope {
            if scoped != session_id {
                tracing::warn!(
                    channel = %channel,
                    session_id,
                    context = %sender,
                    "Dropping cross-session message"
                );
                return;
            }
        }

        let operation = name.operation.prefix();
        let request = match Request::parse(&name, payload) {
            Ok(request) => request,
            Err(e) => {
                e.report(operation);
                return;
            }
        };

        tracing::trace!(channel = %channel, context = %sender, "Dispatching");

        if let Err(e) = self.handle(session_id, sender, request, Reply::new(reply)) {
            e.report(operation);
        }
    }

    fn handle(&self, session_id: SessionId, sender: ContextId, request: Request, reply: Reply) -> Result<()> {
        match request {
            Request::GetExtension { extension_id } => {
                let descriptor = self
                    .registry
                    .extension(session_id, &extension_id)
                    .ok()
                    .map(|ext| ext.descriptor(true));
                reply.send_json(&descriptor);
            }
            Request::GetExtensions => {
                let descriptors: BTreeMap<_, _> =
                    self.registry.descriptors(session_id, false)?.into_iter().collect();
                reply.send_json(&descriptors);
            }
            Request::GetExtensionsContent => {
                let descriptors: BTreeMap<_, _> =
                    self.registry.descriptors(session_id, true)?.into_iter().collect();
                reply.send_json(&descriptors);
            }
            Request::GetBlacklist => {
                reply.send_json(&self.registry.blacklist(session_id)?.patterns());
            }
            Request::CurrentTab => {
                reply.send_json(&self.contexts.tab_descriptor(sender));
            }
            Request::TabsQuery => {
                let focused = self.registry.last_focused_window(session_id)?;
                reply.send_json(&self.contexts.tabs(session_id, focused));
            }
            Request::TabsCreate(request) => self.tabs_create(session_id, sender, request),
            Request::TabsInsertCss(request) => {
                let router = self.clone();
                self.spawn_reply("tabs.insertCSS", reply, async move {
                    router.inject(session_id, request, InjectKind::Css).await
                });
            }
            Request::TabsExecuteScript(request) => {
                let router = self.clone();
                self.spawn_reply("tabs.executeScript", reply, async move {
                    router.inject(session_id, request, InjectKind::Script).await
                });
            }
            Request::TabsSendMessage(request) => {
                self.messenger.tabs_send_message(session_id, sender, request)?;
            }
            Request::RuntimeReload { extension_id } => {
                let extension = self.resolve_extension(session_id, &extension_id)?;
                if extension.background.is_none() {
                    return Err(BusError::NotFound(format!(
                        "background page of {}",
                        extension_id
                    )));
                }
                self.host.reload(session_id, sender);
            }
            Request::RuntimeConnect(mut request) => {
                request.sender = self.messenger.describe_sender(sender, request.sender);
                let outcome = self.ports.connect(
                    &self.registry,
                    &self.contexts,
                    session_id,
                    sender,
                    request,
                )?;
                reply.send(Value::String(outcome.port_id().to_string()));
            }
            Request::RuntimeSendMessage(request) => {
                self.messenger.send_message(session_id, sender, request)?;
            }
            Request::RuntimeGetBackgroundPage { extension_id } => {
                let extension = self.resolve_extension(session_id, &extension_id)?;
                let background = extension.background.ok_or_else(|| {
                    BusError::NotFound(format!("background page of {}", extension_id))
                })?;
                let serializer = self.serializer.clone();
                let contexts = self.contexts.clone();
                self.spawn_reply("runtime.getBackgroundPage", reply, async move {
                    serializer.request(&contexts, session_id, background).await
                });
            }
            Request::PortPostMessage(request) => {
                self.ports.post_message(
                    &self.contexts,
                    session_id,
                    sender,
                    &request.port_id,
                    request.message,
                    request.tab,
                );
            }
            Request::PortDisconnect(request) => {
                self.ports
                    .disconnect(&self.contexts, session_id, sender, &request.port_id);
            }
            Request::StorageOperation(request) => self.storage_operation(session_id, sender, request),
            Request::AlarmsOperation(request) => {
                let value = self.alarms.handle(session_id, sender, request)?;
                reply.send(value);
            }
            Request::SetBadgeText(request) => {
                self.resolve_extension(session_id, &request.extension_id)?;
                self.host
                    .set_badge_text(session_id, &request.extension_id, &request.details);
            }
            Request::CookiesGetAll(details) => {
                let store = self.cookie_store(session_id)?;
                self.spawn_reply("cookies.getAll", reply, async move {
                    let cookies = blocking(move || store.get(&details)).await?;
                    Ok(serde_json::to_value(cookies)?)
                });
            }
            Request::CookiesSet(details) => {
                let store = self.cookie_store(session_id)?;
                self.spawn_reply("cookies.set", reply, async move {
                    let cookie = blocking(move || {
                        store.set(&details)?;
                        first_cookie(store.as_ref(), &details)
                    })
                    .await?;
                    Ok(serde_json::to_value(cookie)?)
                });
            }
            Request::CookiesRemove(details) => {
                let store = self.cookie_store(session_id)?;
                self.spawn_reply("cookies.remove", reply, async move {
                    let cookie = blocking(move || remove_cookie(store.as_ref(), &details)).await?;
                    Ok(serde_json::to_value(cookie)?)
                });
            }
            Request::AddListener(listener) => {
                if listener.is_cookie_change() {
                    self.cookies.subscribe(session_id, listener.id, sender);
                } else {
                    tracing::debug!(scope = %listener.scope, name = %listener.name, "Unsupported listener");
                }
            }
            Request::RemoveListener(listener) => {
                if listener.is_cookie_change() {
                    self.cookies.unsubscribe(session_id, listener.id);
                }
            }
            Request::SendToAllExtensions(request) => {
                let event = ContextEvent::Broadcast {
                    channel: request.channel,
                    args: request.args,
                };
                let delivered = self.contexts.broadcast(session_id, None, &event);
                tracing::trace!(session_id, delivered, "Broadcast to all contexts");
            }
            Request::SendToContext(request) => self.messenger.relay(session_id, request)?,
            Request::WindowObject {
                correlation_id,
                snapshot,
            } => {
                if !self.serializer.resolve(session_id, &correlation_id, snapshot) {
                    tracing::debug!(session_id, correlation_id = %correlation_id, "Late or unknown snapshot reply");
                }
            }
        }

        Ok(())
    }

    fn spawn_reply<F>(&self, operation: &'static str, reply: Reply, task: F)
    where
        F: Future<Output = Result<Value>> + Send + 'static,
    {
        tokio::spawn(async move {
            match task.await {
                Ok(value) => reply.send(value),
                Err(e) => {
                    e.report(operation);
                    reply.send(Value::Null);
                }
            }
        });
    }

    fn tabs_create(&self, session_id: SessionId, sender: ContextId, request: TabsCreateRequest) {
        let channel = tabs_create_response_channel(&request.response_id.to_string());

        let created = self.resolve_window(session_id, sender, &request).and_then(|window_id| {
            self.host
                .create_tab(session_id, window_id, &request.create_properties)
        });

        let payload = match created.and_then(|tab| Ok(serde_json::to_value(tab)?)) {
            Ok(tab) => tab,
            Err(e) => {
                e.report("tabs.create");
                Value::Null
            }
        };

        if let Err(e) = self.contexts.send(sender, ContextEvent::Response { channel, payload }) {
            e.report("tabs.create");
        }
    }

    /// Explicit window, else the focused window for background pages, else
    /// the sender's own window
    fn resolve_window(&self, session_id: SessionId, sender: ContextId, request: &TabsCreateRequest) -> Result<WindowId> {
        if let Some(window_id) = request.create_properties.window_id {
            return Ok(window_id);
        }

        let info = self.contexts.info(sender).ok_or(BusError::StaleTarget(sender))?;
        let window = if info.kind == ContextKind::BackgroundPage {
            self.registry.last_focused_window(session_id)?
        } else {
            info.window_id
        };

        window.ok_or_else(|| BusError::NotFound("window for new tab".to_string()))
    }

    async fn inject(&self, session_id: SessionId, request: InjectRequest, kind: InjectKind) -> Result<Value> {
        let extension = self.resolve_extension(session_id, &request.extension_id)?;
        let target = self
            .contexts
            .tab_context(session_id, request.tab_id)
            .ok_or_else(|| BusError::NotFound(format!("tab {}", request.tab_id)))?;
        let info = self.contexts.info(target).ok_or(BusError::StaleTarget(target))?;

        let blacklist = self.registry.blacklist(session_id)?;
        if let Some(pattern) = blacklist.find_match(&info.url) {
            return Err(BusError::Blacklisted {
                url: info.url,
                pattern: pattern.as_str().to_string(),
            });
        }

        let code = match (&request.details.code, &request.details.file) {
            (Some(code), _) => code.clone(),
            (None, Some(file)) => tokio::fs::read_to_string(extension_file(&extension.path, file)?).await?,
            (None, None) => {
                return Err(BusError::InvalidArgument(
                    "either code or file is required".to_string(),
                ))
            }
        };

        match kind {
            InjectKind::Css => {
                self.host.insert_css(session_id, request.tab_id, &code)?;
                Ok(Value::Null)
            }
            InjectKind::Script => self.host.execute_script(session_id, request.tab_id, &code),
        }
    }

    fn storage_operation(&self, session_id: SessionId, sender: ContextId, request: StorageRequest) {
        let channel = storage_response_channel(&request.id.to_string());
        let known = self.registry.extension(session_id, &request.extension_id).is_ok();
        let storage = self.storage.clone();
        let contexts = self.contexts.clone();

        tokio::spawn(async move {
            let reply = if known {
                storage.execute(session_id, &request).await
            } else {
                StorageReply::Error(format!("unknown extension {}", request.extension_id))
            };

            let payload = match serde_json::to_value(&reply) {
                Ok(payload) => payload,
                Err(e) => {
                    BusError::from(e).report("storage");
                    return;
                }
            };

            if let Err(e) = contexts.send(sender, ContextEvent::Response { channel, payload }) {
                e.report("storage");
            }
        });
    }

    // ==================== Cookies ====================

    fn cookie_store(&self, session_id: SessionId) -> Result<Arc<dyn CookieStore>> {
        self.cookie_stores
            .read()
            .get(&session_id)
            .cloned()
            .ok_or_else(|| BusError::NotFound(format!("cookie store of session {}", session_id)))
    }

    /// Push a cookie change to the session's `cookies.onChanged` subscribers
    pub fn notify_cookie_change(&self, session_id: SessionId, change: &CookieChange) -> usize {
        self.cookies.notify(&self.contexts, session_id, change)
    }

    fn watch_cookies(
        &self,
        session_id: SessionId,
        mut changes: broadcast::Receiver<CookieChange>,
    ) -> Option<AbortHandle> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let router = self.clone();

        let task = runtime.spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        router.notify_cookie_change(session_id, &change);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(session_id, missed, "Cookie change feed lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Some(task.abort_handle())
    }
}

async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BusError::BackendFailure(e.to_string()))?
}

fn first_cookie(store: &dyn CookieStore, details: &CookieDetails) -> Result<Option<Cookie>> {
    Ok(store.get(&details.lookup_filter())?.into_iter().next())
}

/// Look the cookie up first so the caller learns what was removed
fn remove_cookie(store: &dyn CookieStore, details: &CookieDetails) -> Result<Option<Cookie>> {
    let (Some(url), Some(name)) = (&details.url, &details.name) else {
        return Err(BusError::InvalidArgument(
            "cookies.remove needs url and name".to_string(),
        ));
    };

    let Some(cookie) = first_cookie(store, details)? else {
        return Ok(None);
    };
    store.remove(url, name)?;
    Ok(Some(cookie))
}

/// Resolve `file` under the extension directory. A leading `/` is taken
/// relative to `base`; `..` and drive prefixes are rejected.
fn extension_file(base: &Path, file: &str) -> Result<PathBuf> {
    let mut resolved = base.to_path_buf();
    for component in Path::new(file).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(BusError::InvalidArgument(format!(
                    "file {} escapes the extension directory",
                    file
                )))
            }
        }
    }

    if resolved == base {
        return Err(BusError::InvalidArgument(format!("file {} names no file", file)));
    }
    Ok(resolved)
}
