//! Thin façades over external collaborators (spec §4, "LibraryClient /
//! FetcherClient"). Each is a trait so workers can be exercised in tests
//! against a hand-written fake instead of spawning real subprocesses or
//! hitting a real IMAP server.

pub mod fetcher_client;
pub mod library;
pub mod mailbox;
pub mod notify;

pub use fetcher_client::{FetcherClient, ProcessFetcherClient};
pub use library::{LibraryClient, ProcessLibraryClient};
pub use mailbox::{ImapMailboxClient, MailboxClient, UnseenMessage};
pub use notify::{NotificationDispatcher, Severity, WebhookNotificationDispatcher};
