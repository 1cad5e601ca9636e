//! The pipeline stage that hands the data server to request handlers.
//!
//! The hosting framework registers one [`DataServerPlugin`] per application.
//! The plugin builds its data server lazily on first use and, for every
//! request, places a [`DataServerHandle`] in the request's [`Extensions`]:
//!
//! ```rust,no_run
//! use dataserver::context::Extensions;
//! use dataserver::plugin::{DataServerHandle, DataServerPlugin};
//! use serde_json::json;
//!
//! # async fn example() -> dataserver::cache::Result<()> {
//! let plugin = DataServerPlugin::from_options(
//!     "cache",
//!     json!({ "backend": "map", "dataServerOptions": { "ttl": 100 } }),
//! )?;
//!
//! let mut extensions = Extensions::new();
//! plugin.attach(&mut extensions).await?;
//!
//! let cache = extensions.get::<DataServerHandle>().unwrap();
//! cache.increment("stats", "requests", 1, None).await?;
//! # Ok(())
//! # }
//! ```

use std::ops::Deref;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::cache::{
    self, Backend, DataServer, DataServerConfig, DataServerError, Result, SharedDataServer,
};
use crate::context::Extensions;

/// Options the framework passes to the plugin.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginOptions {
    pub backend: Backend,
    pub data_server_options: DataServerConfig,
}

/// The data server as seen by request handlers.
#[derive(Clone)]
pub struct DataServerHandle(SharedDataServer);

impl DataServerHandle {
    pub fn shared(&self) -> SharedDataServer {
        Arc::clone(&self.0)
    }
}

impl Deref for DataServerHandle {
    type Target = dyn DataServer;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

/// Pipeline stage owning one data server.
pub struct DataServerPlugin {
    id: String,
    options: PluginOptions,
    server: OnceCell<SharedDataServer>,
}

impl DataServerPlugin {
    pub fn new(id: impl Into<String>, options: PluginOptions) -> Self {
        Self {
            id: id.into(),
            options,
            server: OnceCell::new(),
        }
    }

    /// Builds the plugin from the framework's JSON option object.
    ///
    /// Keys other than `backend` and `dataServerOptions` are ignored.
    ///
    /// # Errors
    ///
    /// [`DataServerError::InvalidArgument`] when the known keys have the wrong shape.
    pub fn from_options(id: impl Into<String>, options: Value) -> Result<Self> {
        let options = PluginOptions::deserialize(options)
            .map_err(|e| DataServerError::InvalidArgument(format!("plugin options: {e}")))?;
        Ok(Self::new(id, options))
    }

    /// Uses an already configured data server instead of building one.
    pub fn with_server(id: impl Into<String>, server: SharedDataServer) -> Self {
        let options = PluginOptions {
            backend: Backend::default(),
            data_server_options: server.config().clone(),
        };
        Self {
            id: id.into(),
            options,
            server: OnceCell::new_with(Some(server)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn options(&self) -> &PluginOptions {
        &self.options
    }

    /// The plugin's data server, built from the options on the first call.
    ///
    /// Every call returns the same instance.
    ///
    /// # Errors
    ///
    /// Whatever [`cache::build`] reports. A failed build is retried on the next call.
    pub async fn server(&self) -> Result<SharedDataServer> {
        let server = self
            .server
            .get_or_try_init(|| async {
                info!(plugin = %self.id, backend = ?self.options.backend, "building data server");
                cache::build(self.options.backend, self.options.data_server_options.clone()).await
            })
            .await?;
        Ok(Arc::clone(server))
    }

    /// Makes the data server available to the rest of the request.
    pub async fn attach(&self, extensions: &mut Extensions) -> Result<()> {
        let server = self.server().await?;
        extensions.insert(DataServerHandle(server));
        debug!(plugin = %self.id, "data server attached");
        Ok(())
    }

    /// Stops the data server if it was ever built.
    pub async fn stop(&self) -> Result<()> {
        match self.server.get() {
            Some(server) => server.stop().await,
            None => Ok(()),
        }
    }
}
