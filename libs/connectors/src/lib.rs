//! Channel connectors: one implementation of [`ChannelConnector`] per
//! provider, plus the OAuth flow, provider HTTP seams, and the registry the
//! gateway dispatches through.

pub mod connector;
pub mod facebook;
pub mod graph;
pub mod instagram;
pub mod meta;
pub mod oauth;
pub mod registry;
pub mod testutil;
pub mod webchat;
pub mod whatsapp;

pub use connector::{AuthStart, CallbackParams, ChannelConnector, ConnectorContext};
pub use facebook::FacebookConnector;
pub use graph::{GraphClient, HttpGraphClient};
pub use instagram::InstagramConnector;
pub use oauth::{HttpExchanger, OAuthApp, OAuthFlow, RefreshCoordinator, TokenExchanger};
pub use registry::ConnectorRegistry;
pub use webchat::WebChatConnector;
pub use whatsapp::WhatsAppConnector;
