//! User profiles and ranked matches.
//!
//! Profiles are keyed by an opaque id and are unique by username. Saving is
//! an upsert: by id when one is given, otherwise by username. Matches rank
//! every other stored profile with [`AiService::score`].

use std::future::Future;

use actix_web::{HttpResponse, web};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::ai::AiService;
use crate::db::MongoProfileRepository;
use crate::error::ChatError;
use crate::utils::{dedupe_ids, non_empty};

pub const DEFAULT_PROFILE_LIMIT: usize = 50;
pub const MAX_PROFILE_LIMIT: usize = 200;
pub const DEFAULT_MATCH_LIMIT: usize = 10;
pub const MAX_MATCH_LIMIT: usize = 50;
/// How many recent profiles are scored against the requester.
pub const MATCH_CANDIDATE_POOL: usize = 50;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Profile {
    pub id: String,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    /// Interest tags.
    #[serde(alias = "tags")]
    pub areas: Vec<String>,
    pub vibe_tags: Vec<String>,
    pub goals: String,
    pub experience_level: String,
    pub bio: String,
    pub location: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Body of `POST /api/profile`. Absent fields keep their stored value.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    pub id: Option<String>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    #[serde(alias = "tags")]
    pub areas: Option<Vec<String>>,
    pub vibe_tags: Option<Vec<String>>,
    pub goals: Option<String>,
    pub experience_level: Option<String>,
    pub bio: Option<String>,
    pub location: Option<String>,
}

fn set_text(target: &mut String, value: Option<String>) {
    if let Some(value) = value {
        *target = value.trim().to_string();
    }
}

fn clean_tags(tags: Vec<String>) -> Vec<String> {
    dedupe_ids(
        tags.into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty()),
    )
}

impl ProfileUpdate {
    fn apply(self, profile: &mut Profile) {
        if let Some(username) = non_empty(self.username) {
            profile.username = username.trim().to_string();
        }
        set_text(&mut profile.first_name, self.first_name);
        set_text(&mut profile.last_name, self.last_name);
        set_text(&mut profile.email, self.email);
        set_text(&mut profile.goals, self.goals);
        set_text(&mut profile.experience_level, self.experience_level);
        set_text(&mut profile.bio, self.bio);
        set_text(&mut profile.location, self.location);
        if let Some(areas) = self.areas {
            profile.areas = clean_tags(areas);
        }
        if let Some(vibe_tags) = self.vibe_tags {
            profile.vibe_tags = clean_tags(vibe_tags);
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub user_id: String,
    pub username: String,
    pub score: f64,
    pub reasons: Vec<String>,
}

pub trait ProfileRepository: Send + Sync + 'static {
    fn get(&self, id: &str) -> impl Future<Output = Result<Option<Profile>, ChatError>> + Send;

    fn find_by_username(
        &self,
        username: &str,
    ) -> impl Future<Output = Result<Option<Profile>, ChatError>> + Send;

    /// Inserts or replaces the profile stored under `profile.id`.
    fn put(&self, profile: Profile) -> impl Future<Output = Result<(), ChatError>> + Send;

    /// Newest first.
    fn list(&self, limit: usize) -> impl Future<Output = Result<Vec<Profile>, ChatError>> + Send;
}

/// Process-local profiles, kept in insertion order.
#[derive(Default)]
pub struct InMemoryProfileRepository {
    profiles: RwLock<Vec<Profile>>,
}

impl InMemoryProfileRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProfileRepository for InMemoryProfileRepository {
    async fn get(&self, id: &str) -> Result<Option<Profile>, ChatError> {
        Ok(self.profiles.read().await.iter().find(|p| p.id == id).cloned())
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<Profile>, ChatError> {
        Ok(self
            .profiles
            .read()
            .await
            .iter()
            .find(|p| p.username == username)
            .cloned())
    }

    async fn put(&self, profile: Profile) -> Result<(), ChatError> {
        let mut profiles = self.profiles.write().await;
        match profiles.iter_mut().find(|p| p.id == profile.id) {
            Some(existing) => *existing = profile,
            None => profiles.push(profile),
        }
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<Profile>, ChatError> {
        let mut items: Vec<Profile> = self.profiles.read().await.iter().rev().cloned().collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items.truncate(limit);
        Ok(items)
    }
}

pub enum ProfileBackend {
    Memory(InMemoryProfileRepository),
    Mongo(MongoProfileRepository),
}

impl ProfileBackend {
    pub fn kind(&self) -> &'static str {
        match self {
            ProfileBackend::Memory(_) => "memory",
            ProfileBackend::Mongo(_) => "mongodb",
        }
    }
}

impl ProfileRepository for ProfileBackend {
    async fn get(&self, id: &str) -> Result<Option<Profile>, ChatError> {
        match self {
            ProfileBackend::Memory(repo) => repo.get(id).await,
            ProfileBackend::Mongo(repo) => repo.get(id).await,
        }
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<Profile>, ChatError> {
        match self {
            ProfileBackend::Memory(repo) => repo.find_by_username(username).await,
            ProfileBackend::Mongo(repo) => repo.find_by_username(username).await,
        }
    }

    async fn put(&self, profile: Profile) -> Result<(), ChatError> {
        match self {
            ProfileBackend::Memory(repo) => repo.put(profile).await,
            ProfileBackend::Mongo(repo) => repo.put(profile).await,
        }
    }

    async fn list(&self, limit: usize) -> Result<Vec<Profile>, ChatError> {
        match self {
            ProfileBackend::Memory(repo) => repo.list(limit).await,
            ProfileBackend::Mongo(repo) => repo.list(limit).await,
        }
    }
}

/// Profile operations shared by the HTTP handlers.
pub struct ProfileService {
    repo: ProfileBackend,
    // Saves read before they write; one at a time keeps usernames unique.
    writes: Mutex<()>,
}

impl ProfileService {
    pub fn new(repo: ProfileBackend) -> Self {
        Self {
            repo,
            writes: Mutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(ProfileBackend::Memory(InMemoryProfileRepository::new()))
    }

    pub fn kind(&self) -> &'static str {
        self.repo.kind()
    }

    pub async fn save(&self, update: ProfileUpdate) -> Result<Profile, ChatError> {
        let _guard = self.writes.lock().await;
        let now = Utc::now();

        let id = non_empty(update.id.clone());
        let username = non_empty(update.username.clone()).map(|u| u.trim().to_string());
        let mut profile = match (id, username) {
            (Some(id), _) => self
                .repo
                .get(&id)
                .await?
                .ok_or_else(|| ChatError::profile_not_found(id.as_str()))?,
            (None, Some(username)) => match self.repo.find_by_username(&username).await? {
                Some(existing) => existing,
                None => Profile {
                    id: Uuid::new_v4().to_string(),
                    username,
                    created_at: Some(now),
                    ..Default::default()
                },
            },
            (None, None) => return Err(ChatError::invalid("username is required")),
        };
        update.apply(&mut profile);

        if let Some(owner) = self.repo.find_by_username(&profile.username).await? {
            if owner.id != profile.id {
                return Err(ChatError::invalid(format!(
                    "username already taken: {}",
                    profile.username
                )));
            }
        }
        profile.created_at.get_or_insert(now);
        profile.updated_at = Some(now);
        self.repo.put(profile.clone()).await?;
        log::debug!("Saved profile {} (@{})", profile.id, profile.username);
        Ok(profile)
    }

    pub async fn get(&self, id: &str) -> Result<Profile, ChatError> {
        self.repo
            .get(id)
            .await?
            .ok_or_else(|| ChatError::profile_not_found(id))
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<Profile>, ChatError> {
        self.repo.list(limit.clamp(1, MAX_PROFILE_LIMIT)).await
    }

    /// Scores recent profiles against `user_id`, best first.
    pub async fn matches(
        &self,
        ai: &AiService,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<MatchResult>, ChatError> {
        let me = self.get(user_id).await?;
        let candidates: Vec<Profile> = self
            .repo
            .list(MATCH_CANDIDATE_POOL)
            .await?
            .into_iter()
            .filter(|p| p.id != me.id)
            .collect();

        let scores = join_all(candidates.iter().map(|candidate| ai.score(&me, candidate))).await;
        let mut results: Vec<MatchResult> = candidates
            .into_iter()
            .zip(scores)
            .map(|(candidate, score)| MatchResult {
                user_id: candidate.id,
                username: candidate.username,
                score: score.score,
                reasons: score.reasons,
            })
            .collect();
        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        results.truncate(limit.clamp(1, MAX_MATCH_LIMIT));
        Ok(results)
    }
}

#[derive(Deserialize, Debug, Default)]
struct LimitQuery {
    limit: Option<String>,
}

impl LimitQuery {
    /// Missing, non-numeric and non-positive limits all mean `default`.
    fn or(&self, default: usize) -> usize {
        self.limit
            .as_deref()
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .filter(|limit| *limit > 0)
            .map_or(default, |limit| usize::try_from(limit).unwrap_or(usize::MAX))
    }
}

async fn save_profile(
    body: web::Json<ProfileUpdate>,
    profiles: web::Data<ProfileService>,
) -> Result<HttpResponse, ChatError> {
    let profile = profiles.save(body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(profile))
}

async fn list_profiles(
    query: web::Query<LimitQuery>,
    profiles: web::Data<ProfileService>,
) -> Result<HttpResponse, ChatError> {
    let items = profiles.list(query.or(DEFAULT_PROFILE_LIMIT)).await?;
    Ok(HttpResponse::Ok().json(items))
}

async fn get_profile(
    path: web::Path<String>,
    profiles: web::Data<ProfileService>,
) -> Result<HttpResponse, ChatError> {
    let profile = profiles.get(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(profile))
}

async fn list_matches(
    path: web::Path<String>,
    query: web::Query<LimitQuery>,
    profiles: web::Data<ProfileService>,
    ai: web::Data<AiService>,
) -> Result<HttpResponse, ChatError> {
    let user_id = path.into_inner();
    let results = profiles
        .matches(&ai, &user_id, query.or(DEFAULT_MATCH_LIMIT))
        .await?;
    Ok(HttpResponse::Ok().json(results))
}

pub fn profile_scope(cfg: &mut web::ServiceConfig) {
    cfg.route("", web::post().to(save_profile))
        .route("", web::get().to(list_profiles))
        .route("/{id}", web::get().to(get_profile));
}

pub fn matches_scope(cfg: &mut web::ServiceConfig) {
    cfg.route("/{user_id}", web::get().to(list_matches));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorBody;
    use actix_web::{App, http::StatusCode, test};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    macro_rules! app {
        () => {{
            test::init_service(
                App::new()
                    .app_data(web::Data::new(ProfileService::in_memory()))
                    .app_data(web::Data::new(AiService::new(None, None)))
                    .service(web::scope("/api/profile").configure(profile_scope))
                    .service(web::scope("/api/matches").configure(matches_scope)),
            )
            .await
        }};
    }

    macro_rules! save {
        ($app:expr, $body:expr) => {{
            let req = test::TestRequest::post()
                .uri("/api/profile")
                .set_json($body)
                .to_request();
            test::call_service(&$app, req).await
        }};
    }

    #[actix_web::test]
    async fn save_by_username_upserts_and_keeps_fields() {
        let app = app!();
        let resp = save!(app, json!({ "username": " ada ", "bio": "speedrunner", "tags": ["Gaming", "gaming ", ""] }));
        assert_eq!(resp.status(), StatusCode::OK);
        let created: Profile = test::read_body_json(resp).await;
        assert_eq!(created.username, "ada");
        assert_eq!(created.areas, vec!["Gaming", "gaming"]);
        assert!(created.created_at.is_some());

        let resp = save!(app, json!({ "username": "ada", "location": "Lisbon" }));
        let updated: Profile = test::read_body_json(resp).await;
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.bio, "speedrunner");
        assert_eq!(updated.location, "Lisbon");
        assert_eq!(updated.created_at, created.created_at);
    }

    #[actix_web::test]
    async fn save_by_id_renames_unless_taken() {
        let app = app!();
        let ada: Profile = test::read_body_json(save!(app, json!({ "username": "ada" }))).await;
        let _grace: Profile = test::read_body_json(save!(app, json!({ "username": "grace" }))).await;

        let resp = save!(app, json!({ "id": ada.id, "username": "grace" }));
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = save!(app, json!({ "id": ada.id, "username": "countess" }));
        let renamed: Profile = test::read_body_json(resp).await;
        assert_eq!(renamed.id, ada.id);
        assert_eq!(renamed.username, "countess");
    }

    #[actix_web::test]
    async fn save_errors() {
        let app = app!();
        let resp = save!(app, json!({ "bio": "no name" }));
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: ErrorBody = test::read_body_json(resp).await;
        assert_eq!(body.error, "username is required");

        let resp = save!(app, json!({ "id": "missing", "bio": "x" }));
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn get_and_list_profiles() {
        let app = app!();
        let ada: Profile = test::read_body_json(save!(app, json!({ "username": "ada" }))).await;
        save!(app, json!({ "username": "grace" }));

        let req = test::TestRequest::get()
            .uri(&format!("/api/profile/{}", ada.id))
            .to_request();
        let fetched: Profile = test::call_and_read_body_json(&app, req).await;
        assert_eq!(fetched, ada);

        let req = test::TestRequest::get().uri("/api/profile/nobody").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::get().uri("/api/profile?limit=1").to_request();
        let newest: Vec<Profile> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(newest.len(), 1);
        assert_eq!(newest[0].username, "grace");

        let req = test::TestRequest::get().uri("/api/profile?limit=lots").to_request();
        let all: Vec<Profile> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(all.len(), 2);
    }

    #[actix_web::test]
    async fn matches_are_ranked_and_limited() {
        let app = app!();
        let me: Profile =
            test::read_body_json(save!(app, json!({ "username": "ada", "areas": ["Gaming", "Tech"] })))
                .await;
        save!(app, json!({ "username": "cook", "areas": ["Cooking"] }));
        save!(app, json!({ "username": "twin", "areas": ["gaming", "tech"] }));

        let req = test::TestRequest::get()
            .uri(&format!("/api/matches/{}", me.id))
            .to_request();
        let ranked: Vec<MatchResult> = test::call_and_read_body_json(&app, req).await;
        let names: Vec<&str> = ranked.iter().map(|m| m.username.as_str()).collect();
        assert_eq!(names, vec!["twin", "cook"]);
        assert!(ranked[0].score > ranked[1].score);
        assert!(ranked[0].reasons.contains(&"Area overlap".to_string()));

        let req = test::TestRequest::get()
            .uri(&format!("/api/matches/{}?limit=1", me.id))
            .to_request();
        let top: Vec<MatchResult> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(top.len(), 1);

        let req = test::TestRequest::get().uri("/api/matches/nobody").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[::core::prelude::v1::test]
    fn limit_query_defaults_and_parses() {
        let query = |raw: Option<&str>| LimitQuery {
            limit: raw.map(String::from),
        };
        assert_eq!(query(None).or(10), 10);
        assert_eq!(query(Some("0")).or(10), 10);
        assert_eq!(query(Some("-3")).or(10), 10);
        assert_eq!(query(Some("abc")).or(10), 10);
        assert_eq!(query(Some("7")).or(10), 7);
    }

    #[tokio::test]
    async fn match_limit_is_clamped() {
        let profiles = ProfileService::in_memory();
        let ai = AiService::new(None, None);
        let me = profiles
            .save(ProfileUpdate {
                username: Some("me".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        for i in 0..(MAX_MATCH_LIMIT + 5) {
            profiles
                .save(ProfileUpdate {
                    username: Some(format!("user{i}")),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        // The candidate pool excludes the requester, so at most pool-sized results.
        let all = profiles.matches(&ai, &me.id, 10_000).await.unwrap();
        assert!(all.len() <= MAX_MATCH_LIMIT);
        assert!(!all.is_empty());
    }
}
