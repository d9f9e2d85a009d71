mod chat_session;
mod index_lifecycle;
mod providers;
mod watcher;
