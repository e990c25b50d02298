mod coordinator;
mod http;
