pub mod proxy_handlers;
