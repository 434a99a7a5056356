//! End-to-end scenarios over the full runtime with a scripted driver.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio_stream::StreamExt;

use skein::explore;
use skein::{
    Agent, AgentContext, AgentState, BucketName, FnSkill, FnSkillkit, FrameStatus, LlmDriver,
    MockDriver, PlanSkillkit, Role, RunStatus, ScriptedTurn, SkillError, SkillRegistry, Skillkit,
    StreamMode, ToolInterrupt,
};

fn registry_with(skills: Vec<FnSkill>) -> Arc<SkillRegistry> {
    let registry = SkillRegistry::new();
    let kit: Arc<dyn Skillkit> = Arc::new(FnSkillkit::new("test", skills));
    registry.register(kit).unwrap();
    Arc::new(registry)
}

async fn collect(
    mut stream: tokio_stream::wrappers::ReceiverStream<skein::StreamEnvelope>,
) -> Vec<skein::StreamEnvelope> {
    let mut envelopes = Vec::new();
    while let Some(envelope) = stream.next().await {
        envelopes.push(envelope);
    }
    envelopes
}

// S1 - Simple echo: one prompt block, LLM returns "Hello".
#[tokio::test]
async fn s1_simple_echo() {
    let agent = Agent::builder("echo", "@prompt -> greeting\nSay hello\n@end\n")
        .driver(Arc::new(MockDriver::script(vec![ScriptedTurn::text("Hello")])))
        .build()
        .unwrap();
    let envelopes = collect(agent.arun("", StreamMode::Full).await.unwrap()).await;

    let last = envelopes.last().unwrap();
    assert_eq!(last.status, RunStatus::Completed);
    assert_eq!(last.result, Some(json!("Hello")));
    let llm_stages: Vec<_> = last
        .progress
        .iter()
        .filter(|e| e.stage == "llm")
        .collect();
    assert_eq!(llm_stages.len(), 1);
    assert_eq!(llm_stages[0].status, "completed");
    assert_eq!(llm_stages[0].answer.as_deref(), Some("Hello"));
    assert_eq!(agent.context().get_var("greeting"), Some(json!("Hello")));
}

// S2 - Tool call round-trip: assistant(tool_calls) -> tool response -> answer.
#[tokio::test]
async fn s2_tool_call_round_trip() {
    let skills = registry_with(vec![FnSkill::new("_now", "current time", |_, _| async {
        Ok(json!("2025-01-01T00:00:00Z"))
    })]);
    let ctx = AgentContext::builder("clock")
        .driver(Arc::new(MockDriver::script(vec![
            ScriptedTurn::default().with_tool_call(Some("call_x"), "_now", json!({})),
            ScriptedTurn::text("It is 2025."),
        ])))
        .skills(skills)
        .build();

    let blocks =
        skein::parse_agent_file("@explore(tools=\"_now\") -> answer\nWhat time is it?\n@end\n")
            .unwrap();
    let outcome = explore::run(&ctx, &blocks[0]).await.unwrap();
    assert_eq!(outcome.answer, "It is 2025.");

    let history = ctx.messages.bucket(BucketName::History);
    // user body, assistant(tool_calls), tool response, assistant answer
    assert_eq!(history.len(), 4);
    assert_eq!(history[1].role, Role::Assistant);
    let calls = history[1].tool_calls.as_ref().unwrap();
    assert_eq!(calls[0].id, "call_x");
    assert_eq!(history[2].role, Role::Tool);
    assert_eq!(history[2].tool_call_id.as_deref(), Some("call_x"));
    assert_eq!(history[2].text_content(), "2025-01-01T00:00:00Z");
    assert_eq!(history[3].text_content(), "It is 2025.");

    // Three stages: llm, skill, llm - all completed.
    let progress = ctx.vars.get("_progress").unwrap();
    let stages: Vec<(String, String)> = progress
        .as_array()
        .unwrap()
        .iter()
        .map(|e| {
            (
                e["stage"].as_str().unwrap().to_string(),
                e["status"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    assert_eq!(
        stages,
        vec![
            ("llm".to_string(), "completed".to_string()),
            ("skill".to_string(), "completed".to_string()),
            ("llm".to_string(), "completed".to_string()),
        ]
    );
}

// S3 - Multi tool-call with dedup: identical calls execute once.
#[tokio::test]
async fn s3_multi_tool_call_dedup() {
    let executions = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&executions);
    let skills = registry_with(vec![FnSkill::new("search", "search", move |args, _| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!(format!("results for {}", args["q"].as_str().unwrap_or(""))))
        }
    })]);
    let ctx = AgentContext::builder("searcher")
        .driver(Arc::new(MockDriver::script(vec![
            ScriptedTurn::default()
                .with_tool_call(Some("call_a"), "search", json!({"q": "x"}))
                .with_tool_call(Some("call_b"), "search", json!({"q": "x"})),
            ScriptedTurn::text("done"),
        ])))
        .skills(skills)
        .build();

    let blocks =
        skein::parse_agent_file("@explore(tools=\"search\") -> answer\nFind x\n@end\n").unwrap();
    explore::run(&ctx, &blocks[0]).await.unwrap();

    // Only one real execution.
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    let history = ctx.messages.bucket(BucketName::History);
    let tool_messages: Vec<_> = history.iter().filter(|m| m.role == Role::Tool).collect();
    assert_eq!(tool_messages.len(), 2);
    assert_eq!(tool_messages[0].tool_call_id.as_deref(), Some("call_a"));
    assert_eq!(tool_messages[1].tool_call_id.as_deref(), Some("call_b"));
    // Identical content; the second is served from the cache.
    assert_eq!(
        tool_messages[0].text_content(),
        tool_messages[1].text_content()
    );
    let meta = tool_messages[1].metadata.as_ref().unwrap();
    assert_eq!(meta.get("deduplicated"), Some(&json!(true)));
}

// Property 1: every tool_call id gets exactly one response, in order.
#[tokio::test]
async fn tool_call_ids_pair_with_responses_in_order() {
    let skills = registry_with(vec![
        FnSkill::new("alpha", "a", |_, _| async { Ok(json!("A")) }),
        FnSkill::new("beta", "b", |_, _| async { Ok(json!("B")) }),
    ]);
    let ctx = AgentContext::builder("pairs")
        .driver(Arc::new(MockDriver::script(vec![
            ScriptedTurn::default()
                .with_tool_call(None, "alpha", json!({}))
                .with_tool_call(None, "beta", json!({})),
            ScriptedTurn::text("ok"),
        ])))
        .skills(skills)
        .build();
    let blocks = skein::parse_agent_file("@explore -> out\ngo\n@end\n").unwrap();
    explore::run(&ctx, &blocks[0]).await.unwrap();

    let history = ctx.messages.bucket(BucketName::History);
    let assistant = history
        .iter()
        .find(|m| m.tool_calls.is_some())
        .expect("assistant with tool calls");
    let ids: Vec<String> = assistant
        .tool_calls
        .as_ref()
        .unwrap()
        .iter()
        .map(|c| c.id.clone())
        .collect();
    // Fallback ids are unique and monotone.
    assert_eq!(ids, vec!["call_1_0", "call_1_1"]);
    let responses: Vec<String> = history
        .iter()
        .filter(|m| m.role == Role::Tool)
        .filter_map(|m| m.tool_call_id.clone())
        .collect();
    assert_eq!(responses, ids);
}

// S4 - Tool interrupt and resume.
#[tokio::test]
async fn s4_tool_interrupt_and_resume() {
    let approval_kit = FnSkillkit::new(
        "approval",
        vec![FnSkill::new("approve", "ask the user", |args, _| async move {
            Err(SkillError::Interrupt(ToolInterrupt {
                tool: "approve".to_string(),
                args,
            }))
        })],
    );
    let agent = Agent::builder(
        "approver",
        "@explore(tools=\"approve\") -> answer\nGet approval\n@end\n",
    )
    .driver(Arc::new(MockDriver::script(vec![
        ScriptedTurn::default().with_tool_call(Some("call_ap"), "approve", json!({"amount": 5})),
        ScriptedTurn::text("Approved, proceeding."),
    ])))
    .skillkit(Arc::new(approval_kit))
    .build()
    .unwrap();

    let envelopes = collect(agent.arun("", StreamMode::Full).await.unwrap()).await;
    assert!(!envelopes.is_empty());
    assert_eq!(agent.state(), AgentState::Paused);

    // Frame is parked waiting for intervention with a structured error.
    let frame_id = agent.root_frame_id().unwrap();
    {
        let frame = agent.context().frames.get(&frame_id).unwrap();
        assert_eq!(frame.status, FrameStatus::WaitingForIntervention);
        let error = frame.error.as_ref().unwrap();
        assert_eq!(error.error_type, "ToolInterrupt");
        assert_eq!(error.tool_name.as_deref(), Some("approve"));
        assert_eq!(error.tool_args, Some(json!({"amount": 5})));
        assert!(error.intervention_snapshot_id.is_some());
    }

    // continue_chat must fast-fail: the caller has to resume with updates.
    let err = agent.continue_chat("hello?").await.unwrap_err();
    assert!(err.to_string().contains("NEED_RESUME"));

    let mut updates = Map::new();
    updates.insert("tool_result".to_string(), json!({"confirmed": true}));
    let envelopes = collect(agent.resume(updates).await.unwrap()).await;
    let last = envelopes.last().unwrap();
    assert_eq!(last.status, RunStatus::Completed);
    assert_eq!(last.result, Some(json!("Approved, proceeding.")));
    assert_eq!(
        agent.context().frames.get(&frame_id).unwrap().status,
        FrameStatus::Completed
    );

    // The fabricated tool response carries the intervention payload.
    let history = agent.context().messages.bucket(BucketName::History);
    let tool_message = history
        .iter()
        .find(|m| m.role == Role::Tool)
        .expect("tool response");
    assert_eq!(tool_message.tool_call_id.as_deref(), Some("call_ap"));
    assert!(tool_message.text_content().contains("confirmed"));
}

// S5 - on_stop expression retry.
#[tokio::test]
async fn s5_on_stop_expression_retry() {
    let ctx = AgentContext::builder("writer")
        .driver(Arc::new(MockDriver::script(vec![
            ScriptedTurn::text("short"),
            ScriptedTurn::text("x".repeat(120)),
        ])))
        .build();
    let blocks = skein::parse_agent_file(
        "@explore(on_stop=\"len(answer) > 50\", threshold=0.5, max_retries=1) -> essay\nWrite\n@end\n",
    )
    .unwrap();
    let outcome = explore::run(&ctx, &blocks[0]).await.unwrap();

    assert_eq!(outcome.attempts, 2);
    let hook = outcome.hook.unwrap();
    assert!(hook.passed);
    assert!(!hook.retry);
    assert_eq!(hook.score, 1.0);

    // The retry feedback landed in the scratchpad.
    let scratchpad = ctx.messages.bucket(BucketName::Scratchpad);
    assert_eq!(scratchpad.len(), 1);
    assert!(scratchpad[0].text_content().contains("Verification failed"));
}

// S6 - Plan guardrail: the loop must not stop while tasks are unfinished.
#[tokio::test]
async fn s6_plan_guardrail() {
    // Parent and subtask turns route through one driver; subtask prompts are
    // marked so the router can tell them apart.
    struct RouterDriver {
        parent: MockDriver,
        subtask: MockDriver,
    }

    #[async_trait::async_trait]
    impl LlmDriver for RouterDriver {
        fn model_name(&self) -> &str {
            "router"
        }

        async fn chat_stream(
            &self,
            messages: &[skein::Message],
            tools: Option<&[Value]>,
            params: &skein::ChatParams,
            cancel: tokio_util::sync::CancellationToken,
        ) -> Result<skein::llm::ChunkStream, skein::llm::LlmError> {
            let is_subtask = messages
                .iter()
                .any(|m| m.text_content().contains("SUBTASK"));
            if is_subtask {
                // Keep subtasks in flight long enough for the parent to
                // attempt an early stop while the plan is still active.
                tokio::time::sleep(std::time::Duration::from_millis(300)).await;
                self.subtask.chat_stream(messages, tools, params, cancel).await
            } else {
                self.parent.chat_stream(messages, tools, params, cancel).await
            }
        }
    }

    let driver = RouterDriver {
        parent: MockDriver::script(vec![
            ScriptedTurn::default().with_tool_call(
                Some("call_plan"),
                "_plan_tasks",
                json!({
                    "tasks": [
                        {"id": "t1", "name": "one", "prompt": "SUBTASK one"},
                        {"id": "t2", "name": "two", "prompt": "SUBTASK two"}
                    ],
                    "execution_mode": "parallel",
                    "max_concurrency": 2
                }),
            ),
            // The model tries to stop while tasks run; the guardrail must
            // force continuation.
            ScriptedTurn::text("I think we are done."),
            ScriptedTurn::default().with_tool_call(Some("call_wait"), "_wait", json!({"seconds": 1})),
            ScriptedTurn::text("All tasks finished."),
        ]),
        subtask: MockDriver::script(vec![
            ScriptedTurn::text("subtask one done"),
            ScriptedTurn::text("subtask two done"),
        ]),
    };

    let skills = SkillRegistry::new();
    skills.register(Arc::new(PlanSkillkit)).unwrap();
    let ctx = AgentContext::builder("planner")
        .driver(Arc::new(driver))
        .skills(Arc::new(skills))
        .build();

    let blocks = skein::parse_agent_file("@explore -> report\nPlan the work\n@end\n").unwrap();
    let outcome = explore::run(&ctx, &blocks[0]).await.unwrap();
    assert_eq!(outcome.answer, "All tasks finished.");

    // Plan finished: counters reached the total.
    let summary = ctx.plan_summary().unwrap();
    assert_eq!(summary.completed_tasks, summary.total_tasks);
    assert_eq!(summary.total_tasks, 2);
    assert!(!ctx.has_active_plan());

    // The guardrail injected a control-bucket hint when the model stopped early.
    let control = ctx.messages.bucket(BucketName::Control);
    assert!(!control.is_empty());
    assert!(control[0].text_content().contains("_check_progress"));
}

// Boundary: explore with an empty tool set behaves as a prompt.
#[tokio::test]
async fn explore_without_tools_behaves_as_prompt() {
    let ctx = AgentContext::builder("plain")
        .driver(Arc::new(MockDriver::script(vec![ScriptedTurn::text("just text")])))
        .build();
    let blocks = skein::parse_agent_file("@explore -> out\nSay something\n@end\n").unwrap();
    let outcome = explore::run(&ctx, &blocks[0]).await.unwrap();
    assert_eq!(outcome.answer, "just text");
    assert_eq!(ctx.vars.get("out"), Some(json!("just text")));
}

// Boundary: zero-length LLM output terminates cleanly with answer "".
#[tokio::test]
async fn explore_with_empty_output_terminates() {
    let ctx = AgentContext::builder("silent")
        .driver(Arc::new(MockDriver::empty()))
        .build();
    let blocks = skein::parse_agent_file("@explore -> out\nSay nothing\n@end\n").unwrap();
    let outcome = explore::run(&ctx, &blocks[0]).await.unwrap();
    assert_eq!(outcome.answer, "");
    assert_eq!(ctx.vars.get("out"), Some(json!("")));
}

// Two identical runs over the same transcript produce identical id sequences.
#[tokio::test]
async fn tool_call_ids_are_deterministic_across_runs() {
    async fn run_once() -> Vec<String> {
        let skills = registry_with(vec![FnSkill::new("t", "t", |_, _| async { Ok(json!("ok")) })]);
        let ctx = AgentContext::builder("det")
            .driver(Arc::new(MockDriver::script(vec![
                ScriptedTurn::default()
                    .with_tool_call(None, "t", json!({"a": 1}))
                    .with_tool_call(None, "t", json!({"a": 2})),
                ScriptedTurn::default().with_tool_call(None, "t", json!({"a": 3})),
                ScriptedTurn::text("done"),
            ])))
            .skills(skills)
            .build();
        let blocks = skein::parse_agent_file("@explore -> out\ngo\n@end\n").unwrap();
        explore::run(&ctx, &blocks[0]).await.unwrap();
        ctx.messages
            .bucket(BucketName::History)
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| m.tool_call_id.clone())
            .collect()
    }
    let first = run_once().await;
    let second = run_once().await;
    assert_eq!(first, second);
    assert_eq!(first, vec!["call_1_0", "call_1_1", "call_2_0"]);
}

// Skill failures become error tool-responses; the loop keeps going.
#[tokio::test]
async fn skill_errors_do_not_abort_the_loop() {
    let skills = registry_with(vec![
        FnSkill::new("bad", "always fails", |_, _| async {
            Err(SkillError::Execution {
                skill: "bad".into(),
                reason: "boom".into(),
            })
        }),
        FnSkill::new("good", "works", |_, _| async { Ok(json!("fine")) }),
    ]);
    let ctx = AgentContext::builder("mixed")
        .driver(Arc::new(MockDriver::script(vec![
            ScriptedTurn::default()
                .with_tool_call(Some("c1"), "bad", json!({}))
                .with_tool_call(Some("c2"), "good", json!({})),
            ScriptedTurn::text("recovered"),
        ])))
        .skills(skills)
        .build();
    let blocks = skein::parse_agent_file("@explore -> out\ngo\n@end\n").unwrap();
    let outcome = explore::run(&ctx, &blocks[0]).await.unwrap();
    assert_eq!(outcome.answer, "recovered");

    let history = ctx.messages.bucket(BucketName::History);
    let tools: Vec<_> = history.iter().filter(|m| m.role == Role::Tool).collect();
    assert_eq!(tools.len(), 2);
    assert!(tools[0].text_content().starts_with("Error:"));
    assert_eq!(
        tools[0].metadata.as_ref().unwrap().get("error"),
        Some(&json!(true))
    );
    assert_eq!(tools[1].text_content(), "fine");
}

// Verifier agent hook: a hook agent file scores the answer.
#[tokio::test]
async fn on_stop_agent_verifier_runs_in_cow_context() {
    let verifier = "@assign(expr=\"1.0\") -> verdict\n@end\n";
    let ctx = AgentContext::builder("checked")
        .driver(Arc::new(MockDriver::script(vec![ScriptedTurn::text("answer")])))
        .hook_agent("verifier", verifier)
        .build();
    let blocks = skein::parse_agent_file(
        "@explore(on_stop=\"@verifier\") -> out\nWrite\n@end\n",
    )
    .unwrap();
    let outcome = explore::run(&ctx, &blocks[0]).await.unwrap();
    let hook = outcome.hook.unwrap();
    assert_eq!(hook.score, 1.0);
    assert!(hook.passed);
    // The verifier wrote nothing into the parent context.
    assert_eq!(ctx.vars.get("verdict"), None);
}
