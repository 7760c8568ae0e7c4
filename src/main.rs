use actix_web::{App, HttpServer, middleware::Logger, web};
use dotenvy::dotenv;
use mongodb::Client;
use std::io::{Error, Result};
use tokio::signal::unix::{SignalKind, signal};
use tokio::spawn;
use tokio::task::JoinHandle;

use technova_chat::ai::AiService;
use technova_chat::chat_server::{ChatServer, ChatServerHandle};
use technova_chat::config::Config;
use technova_chat::db::{MongoProfileRepository, MongoRepository};
use technova_chat::error::ChatError;
use technova_chat::profiles::{ProfileBackend, ProfileService};
use technova_chat::server::configure;
use technova_chat::store::InMemoryRepository;

async fn start_stores(config: &Config) -> (ChatServerHandle, JoinHandle<()>, ProfileService) {
    if let Some(uri) = &config.mongodb_uri {
        match open_mongo(uri, &config.mongodb_db).await {
            Ok((repo, profiles)) => {
                let (chat_server, chat_handle) = ChatServer::new(repo);
                let profiles = ProfileService::new(ProfileBackend::Mongo(profiles));
                return (chat_handle, spawn(chat_server.run()), profiles);
            }
            Err(err) => {
                log::error!("MongoDB connection error: {}; continuing with in-memory store", err)
            }
        }
    } else {
        log::warn!("No MONGODB_URI set. Using in-memory chat store (dev chat mode).");
    }

    let (chat_server, chat_handle) = ChatServer::new(InMemoryRepository::new());
    (chat_handle, spawn(chat_server.run()), ProfileService::in_memory())
}

async fn open_mongo(
    uri: &str,
    database: &str,
) -> std::result::Result<(MongoRepository, MongoProfileRepository), ChatError> {
    let client = Client::with_uri_str(uri).await?;
    let profiles = MongoProfileRepository::open(&client.database(database)).await?;
    let repo = MongoRepository::open(client, database).await?;
    Ok((repo, profiles))
}

#[actix_web::main]
async fn main() -> Result<()> {
    let _ = dotenv();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env().map_err(Error::other)?;

    let (chat_handle, chat_server_handle, profiles) = start_stores(&config).await;
    log::info!("Profile store: {}", profiles.kind());

    let ai = web::Data::new(AiService::new(
        config.gemini_api_key.clone(),
        config.gemini_model.clone(),
    ));
    log::info!("AI configured={} model={}", ai.configured(), ai.model());

    let chat_handle = web::Data::new(chat_handle);
    let profiles = web::Data::new(profiles);

    let http_server = HttpServer::new(move || {
        App::new()
            .app_data(chat_handle.clone())
            .app_data(ai.clone())
            .app_data(profiles.clone())
            .configure(configure)
            .wrap(Logger::default())
    })
    .workers(config.workers)
    .bind((config.host.as_str(), config.port))?
    .run();

    log::info!("Server listening on http://{}:{}", config.host, config.port);

    let mut term_signal = signal(SignalKind::terminate())?;
    let mut int_signal = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = http_server => log::info!("HTTP server stopped"),
        _ = chat_server_handle => log::warn!("Chat server stopped"),
        _ = term_signal.recv() => log::info!("Received SIGTERM"),
        _ = int_signal.recv() => log::info!("Received SIGINT"),
    }

    log::info!("Shutting down...");
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;

    Ok(())
}
