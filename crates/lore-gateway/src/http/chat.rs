use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use crate::app::AppState;
use crate::auth::CurrentUser;
use crate::envelope::{ApiError, ApiResult};
use crate::http::robots::{run_retrieval_test, RetrievalTestRequest, RetrievalTestResponse};
use crate::sse::{context_frames, StreamEmitter, SSE_EVENT};
use lore_cache::ContextMessage;
use lore_providers::{
    build_provider, ChatMessage, ChatRequest as ProviderRequest, LlmProvider, Role, StreamChunk,
};
use lore_retrieval::RetrievedContext;
use lore_store::types::{MessageUsage, Robot, Session, TimeMetrics, User};

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Answer based on the provided knowledge base content.";
const NO_KNOWLEDGE_FOUND: &str = "No relevant knowledge base content was found.";

#[derive(Deserialize)]
pub struct AskRequest {
    pub robot_id: i64,
    pub session_id: Option<String>,
    pub question: String,
}

#[derive(Serialize)]
pub struct AskResponse {
    pub session_id: String,
    pub question: String,
    pub answer: String,
    pub contexts: Vec<RetrievedContext>,
    pub token_usage: serde_json::Value,
    pub response_time: f64,
}

struct ChatSetup {
    session: Session,
    robot: Robot,
    knowledge_ids: Vec<i64>,
}

/// Steps shared by both chat endpoints: session resolve/create (robot
/// mismatch is a 400), robot load, and the active-knowledge filter.
fn prepare(state: &AppState, user: &User, req: &AskRequest) -> ApiResult<ChatSetup> {
    if req.question.trim().is_empty() {
        return Err(ApiError::validation("question must not be empty"));
    }

    let robot = state
        .robots
        .get_owned(req.robot_id, user.id, user.is_admin())?;

    let session = match &req.session_id {
        Some(session_id) => {
            let session = state.sessions.get_owned(session_id, user.id)?;
            if session.robot_id != req.robot_id {
                return Err(ApiError::bad_request("session belongs to a different robot"));
            }
            session
        }
        None => {
            let session = state.sessions.create(user.id, req.robot_id, None)?;
            state.context.init_context(
                &session.session_id,
                user.id,
                req.robot_id,
                &robot.system_prompt,
            );
            session
        }
    };

    let bound = state.robots.knowledge_ids(robot.id)?;
    if bound.is_empty() {
        return Err(ApiError::bad_request("robot has no knowledge bases bound"));
    }
    let knowledge_ids = state.knowledge.active_ids(&bound)?;
    if knowledge_ids.is_empty() {
        return Err(ApiError::bad_request("robot has no knowledge"));
    }

    Ok(ChatSetup {
        session,
        robot,
        knowledge_ids,
    })
}

/// Cache-or-rebuild: a cold cache is refilled from relational history
/// before the window is read.
fn load_history(state: &AppState, session: &Session, robot: &Robot) -> Vec<ContextMessage> {
    let sid = &session.session_id;
    if !state.context.context_exists(sid) {
        state
            .context
            .init_context(sid, session.user_id, session.robot_id, &robot.system_prompt);
        if session.message_count > 0 {
            if let Ok(rows) = state
                .sessions
                .recent_messages(sid, state.context.max_messages())
            {
                let messages: Vec<ContextMessage> = rows
                    .into_iter()
                    .map(|row| ContextMessage {
                        role: row.role,
                        content: row.content,
                        tokens: row.total_tokens,
                        timestamp: row.created_at,
                    })
                    .collect();
                state.context.load_from_history(sid, &messages);
            }
        }
    }
    state.context.get_context_messages(sid)
}

fn build_messages(
    robot: &Robot,
    history: &[ContextMessage],
    question: &str,
    contexts: &[RetrievedContext],
) -> Vec<ChatMessage> {
    let system_prompt = if robot.system_prompt.is_empty() {
        DEFAULT_SYSTEM_PROMPT
    } else {
        &robot.system_prompt
    };

    let mut messages = vec![ChatMessage {
        role: Role::System,
        content: system_prompt.to_string(),
    }];
    for msg in history {
        let role = match msg.role.as_str() {
            "assistant" => Role::Assistant,
            "system" => Role::System,
            _ => Role::User,
        };
        messages.push(ChatMessage {
            role,
            content: msg.content.clone(),
        });
    }

    let context_text = if contexts.is_empty() {
        NO_KNOWLEDGE_FOUND.to_string()
    } else {
        contexts
            .iter()
            .enumerate()
            .map(|(i, ctx)| format!("[Doc {}] {}\n{}", i + 1, ctx.filename, ctx.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    };
    messages.push(ChatMessage {
        role: Role::User,
        content: format!(
            "## Knowledge:\n{}\n\n## Question:\n{}\n\nAnswer using the knowledge above; say so when it does not cover the question.",
            context_text, question
        ),
    });
    messages
}

/// The chat LLM plus a ready provider; both the LLM and a usable API key
/// are preconditions of the endpoint.
fn resolve_chat_provider(
    state: &AppState,
    chat_llm_id: i64,
) -> ApiResult<(Box<dyn LlmProvider>, String)> {
    let llm = state
        .llms
        .get_active(chat_llm_id)
        .map_err(|e| ApiError::bad_request(format!("chat model unavailable: {}", e)))?;
    let api_key = state
        .llms
        .active_api_key(llm.id)?
        .ok_or_else(|| ApiError::bad_request(format!("LLM {} has no usable API key", llm.name)))?;
    let provider = build_provider(&llm.provider, api_key, llm.base_url.clone(), llm.api_version.clone());
    Ok((provider, llm.model_name))
}

fn contexts_json(contexts: &[RetrievedContext]) -> serde_json::Value {
    serde_json::to_value(contexts).unwrap_or_else(|_| serde_json::json!([]))
}

/// POST /chat/ask — unary chat.
pub async fn ask(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<AskRequest>,
) -> ApiResult<Json<AskResponse>> {
    let setup = prepare(&state, &user, &req)?;
    let sid = setup.session.session_id.clone();

    if !state.context.acquire_session_lock(&sid) {
        return Err(ApiError::bad_request(
            "another request is already running in this session",
        ));
    }
    let result = ask_inner(&state, &user, &req, &setup).await;
    state.context.release_session_lock(&sid);
    result
}

async fn ask_inner(
    state: &AppState,
    user: &User,
    req: &AskRequest,
    setup: &ChatSetup,
) -> ApiResult<Json<AskResponse>> {
    let sid = setup.session.session_id.clone();
    let started = std::time::Instant::now();

    let retrieval_start = std::time::Instant::now();
    let contexts = state
        .retriever
        .hybrid_retrieve(
            &setup.robot,
            &setup.knowledge_ids,
            &req.question,
            setup.robot.top_k as usize,
        )
        .await?;
    let retrieval_ms = retrieval_start.elapsed().as_millis() as i64;

    let history = load_history(state, &setup.session, &setup.robot);

    state
        .sessions
        .save_message(&sid, "user", &req.question, None, None, None)?;
    state.context.add_user_message(&sid, &req.question, 0);

    let messages = build_messages(&setup.robot, &history, &req.question, &contexts);
    let (provider, model) = resolve_chat_provider(state, setup.robot.chat_llm_id)?;

    let mut request = ProviderRequest::new(model, messages);
    request.temperature = setup.robot.temperature as f32;
    request.max_tokens = setup.robot.max_tokens as u32;

    let generation_start = std::time::Instant::now();
    let (answer, usage) = match provider.chat(&request).await {
        Ok(resp) => (
            resp.content,
            MessageUsage {
                prompt_tokens: resp.prompt_tokens as i64,
                completion_tokens: resp.completion_tokens as i64,
                total_tokens: resp.total_tokens as i64,
            },
        ),
        Err(e) => {
            // The unary endpoint must produce an answer; upstream failures
            // degrade to an apology instead of a 500.
            error!(error = %e, "chat provider failed");
            (
                format!("Sorry, the answer could not be generated: {}", e),
                MessageUsage::default(),
            )
        }
    };
    let generation_ms = generation_start.elapsed().as_millis() as i64;

    state.sessions.save_message(
        &sid,
        "assistant",
        &answer,
        Some(&contexts_json(&contexts)),
        Some(usage),
        Some(TimeMetrics {
            retrieval_time_ms: retrieval_ms,
            generation_time_ms: generation_ms,
            total_time_ms: started.elapsed().as_millis() as i64,
        }),
    )?;
    state.context.add_assistant_message(&sid, &answer, usage.total_tokens);
    state.context.update_active_session(user.id, &sid);

    info!(session_id = %sid, total_ms = started.elapsed().as_millis() as i64, "chat turn completed");
    Ok(Json(AskResponse {
        session_id: sid,
        question: req.question.clone(),
        answer,
        contexts,
        token_usage: serde_json::json!({
            "prompt_tokens": usage.prompt_tokens,
            "completion_tokens": usage.completion_tokens,
            "total_tokens": usage.total_tokens,
        }),
        response_time: started.elapsed().as_secs_f64(),
    }))
}

/// POST /chat/ask/stream — SSE chat. The orchestration runs in a detached
/// task feeding a frame channel, so persistence happens even when the
/// client disconnects mid-stream.
pub async fn ask_stream(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<AskRequest>,
) -> ApiResult<impl IntoResponse> {
    let setup = prepare(&state, &user, &req)?;
    let sid = setup.session.session_id.clone();

    if !state.context.acquire_session_lock(&sid) {
        return Err(ApiError::bad_request(
            "another request is already running in this session",
        ));
    }

    let retrieval_start = std::time::Instant::now();
    let contexts = match state
        .retriever
        .hybrid_retrieve(
            &setup.robot,
            &setup.knowledge_ids,
            &req.question,
            setup.robot.top_k as usize,
        )
        .await
    {
        Ok(contexts) => contexts,
        Err(e) => {
            state.context.release_session_lock(&sid);
            return Err(e.into());
        }
    };
    let retrieval_ms = retrieval_start.elapsed().as_millis() as i64;

    let history = load_history(&state, &setup.session, &setup.robot);

    if let Err(e) = state
        .sessions
        .save_message(&sid, "user", &req.question, None, None, None)
    {
        state.context.release_session_lock(&sid);
        return Err(e.into());
    }
    state.context.add_user_message(&sid, &req.question, 0);

    let messages = build_messages(&setup.robot, &history, &req.question, &contexts);
    let (provider, model) = match resolve_chat_provider(&state, setup.robot.chat_llm_id) {
        Ok(resolved) => resolved,
        Err(e) => {
            state.context.release_session_lock(&sid);
            return Err(e);
        }
    };

    let mut request = ProviderRequest::new(model, messages);
    request.temperature = setup.robot.temperature as f32;
    request.max_tokens = setup.robot.max_tokens as u32;
    request.stream = true;

    let (frame_tx, frame_rx) = mpsc::channel::<serde_json::Value>(64);
    let task_state = state.clone();
    let user_id = user.id;
    let session_id = sid.clone();
    let turn_start = std::time::Instant::now();

    tokio::spawn(async move {
        let mut emitter = StreamEmitter::new(&session_id);
        let generation_start = std::time::Instant::now();

        for frame in context_frames(&contexts) {
            // A closed frame channel just means the client left; keep
            // consuming so the turn still persists.
            let _ = frame_tx.send(frame).await;
        }

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<StreamChunk>(64);
        let producer = tokio::spawn(async move {
            let result = provider.chat_stream(&request, chunk_tx.clone()).await;
            if let Err(e) = result {
                warn!(error = %e, "chat stream failed before completion");
                let _ = chunk_tx
                    .send(StreamChunk {
                        content_delta: format!("Error: {}", e),
                        finish_reason: Some("error".to_string()),
                        ..Default::default()
                    })
                    .await;
            }
        });

        while let Some(chunk) = chunk_rx.recv().await {
            for frame in emitter.on_chunk(chunk) {
                let _ = frame_tx.send(frame).await;
            }
        }
        // Providers that end without a finish_reason still close the wire
        // protocol with a single finished frame.
        for frame in emitter.finish_frames() {
            let _ = frame_tx.send(frame).await;
        }
        let _ = producer.await;

        // Terminal persistence, runs regardless of client disconnect.
        let usage = MessageUsage {
            prompt_tokens: emitter.usage.prompt_tokens as i64,
            completion_tokens: emitter.usage.completion_tokens as i64,
            total_tokens: emitter.usage.total_tokens as i64,
        };
        if let Err(e) = task_state.sessions.save_message(
            &session_id,
            "assistant",
            &emitter.full_answer,
            Some(&contexts_json(&contexts)),
            Some(usage),
            Some(TimeMetrics {
                retrieval_time_ms: retrieval_ms,
                generation_time_ms: generation_start.elapsed().as_millis() as i64,
                total_time_ms: turn_start.elapsed().as_millis() as i64,
            }),
        ) {
            error!(error = %e, "failed to persist streamed assistant message");
        }
        task_state
            .context
            .add_assistant_message(&session_id, &emitter.full_answer, usage.total_tokens);
        task_state.context.update_active_session(user_id, &session_id);
        task_state.context.release_session_lock(&session_id);
    });

    let stream = ReceiverStream::new(frame_rx).map(|frame| {
        Ok::<Event, Infallible>(Event::default().event(SSE_EVENT).data(frame.to_string()))
    });

    Ok((
        [
            ("Cache-Control", "no-cache"),
            ("Connection", "keep-alive"),
            ("X-Accel-Buffering", "no"),
        ],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    ))
}

#[derive(Deserialize)]
pub struct KnowledgeTestRequest {
    pub knowledge_id: i64,
    pub query: String,
    #[serde(default = "default_test_top_k")]
    pub top_k: usize,
    #[serde(default = "default_mode")]
    pub retrieval_mode: String,
}

fn default_test_top_k() -> usize {
    5
}
fn default_mode() -> String {
    "hybrid".to_string()
}

/// POST /chat/test — ad-hoc retrieval against a single knowledge base,
/// sharing the robot retrieval-test machinery and rate limit.
pub async fn knowledge_test(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<KnowledgeTestRequest>,
) -> ApiResult<Json<RetrievalTestResponse>> {
    if !state.retrieval_limiter.check(user.id) {
        return Err(ApiError::new(
            axum::http::StatusCode::TOO_MANY_REQUESTS,
            "retrieval test limit reached (30/min), slow down",
        ));
    }

    state
        .knowledge
        .get_owned(req.knowledge_id, user.id, user.is_admin())?;

    // Throwaway robot profile: retrieval only, no rerank.
    let robot = Robot {
        id: 0,
        user_id: user.id,
        name: "retrieval-test".to_string(),
        description: None,
        chat_llm_id: 0,
        rerank_llm_id: None,
        enable_rerank: false,
        top_k: req.top_k as i64,
        temperature: 0.7,
        max_tokens: 2000,
        system_prompt: String::new(),
        created_at: String::new(),
    };

    run_retrieval_test(
        &state,
        &robot,
        &[req.knowledge_id],
        RetrievalTestRequest {
            query: req.query,
            top_k: req.top_k,
            retrieval_mode: req.retrieval_mode,
        },
    )
    .await
}
