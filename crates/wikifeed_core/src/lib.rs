pub mod config;
pub mod error;
pub mod fanout;
pub mod notifications;
pub mod session;
pub mod summary;

pub use error::ClientError;
pub use notifications::{Notification, NotificationClient, NotificationsEndpoint};
pub use session::{HttpSession, RequestPriority, Session};
pub use summary::{ArticleSummary, SummaryClient};
pub use tokio_util::sync::CancellationToken;
