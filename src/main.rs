//! Concierge 终端前端
//!
//! 入口：初始化日志、加载配置、构建编排器，然后运行交互循环。
//! 用法：`concierge [config.toml]`。对话中按 Ctrl-C 只取消当前这一轮；在提示符处按 Ctrl-C 退出。

use std::future::Future;
use std::path::PathBuf;

use anyhow::Context;
use concierge::config::{load_config, AppConfig};
use concierge::core::OrchestratorError;
use concierge::{Orchestrator, OrchestratorBuilder, TurnStatus};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio_util::sync::CancellationToken;

const BANNER: &str = "\
============================================================
Concierge assistant
============================================================
Capabilities: web search, video search, weather, locations, distance
Type 'quit', 'exit', or 'bye' to end the session
Type 'memory' to see the conversation summary
Type 'clear' to clear conversation history
Type 'export <path>' / 'import <path>' to save or load memory
Press Ctrl-C during a reply to cancel it
============================================================";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    concierge::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let orchestrator = OrchestratorBuilder::new(cfg)
        .build()
        .context("Failed to build orchestrator")?;

    println!("{}\n", BANNER);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"You: ").await?;
        stdout.flush().await?;
        // 安装 ctrl_c 监听后默认 SIGINT 处理不再生效，提示符处也要自己监听
        let line = match next_input(&mut lines, tokio::signal::ctrl_c()).await? {
            Input::Line(line) => line,
            Input::Eof | Input::Interrupted => break,
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match handle_command(&orchestrator, input).await {
            Some(Flow::Quit) => break,
            Some(Flow::Continue) => continue,
            None => {}
        }

        let cancel = CancellationToken::new();
        let turn = orchestrator.process_message_with_cancel(input, &cancel);
        tokio::pin!(turn);
        let finished = tokio::select! {
            r = &mut turn => Some(r),
            _ = tokio::signal::ctrl_c() => None,
        };
        let result = match finished {
            Some(r) => r,
            None => {
                cancel.cancel();
                turn.await
            }
        };

        match result {
            Ok(outcome) if outcome.status == TurnStatus::Success => {
                println!("Assistant: {}", outcome.response_text);
                if !outcome.tool_calls.is_empty() {
                    let used: Vec<&str> = outcome.tool_calls.iter().map(|c| c.capability_name.as_str()).collect();
                    println!("\n[tools used: {}]", used.join(", "));
                }
            }
            Ok(outcome) => println!("Error: {}", outcome.response_text),
            Err(OrchestratorError::Cancelled) => println!("(cancelled)"),
            Err(e) => println!("Error: {}", e),
        }
        println!();
    }

    println!("\nGoodbye!");
    Ok(())
}

#[derive(Debug, PartialEq)]
enum Input {
    Line(String),
    Eof,
    Interrupted,
}

/// 读一行；interrupt 先完成时返回 Interrupted
async fn next_input<R, F>(lines: &mut Lines<R>, interrupt: F) -> anyhow::Result<Input>
where
    R: AsyncBufRead + Unpin,
    F: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        biased;
        _ = interrupt => Ok(Input::Interrupted),
        line = lines.next_line() => Ok(match line.context("Failed to read input")? {
            Some(line) => Input::Line(line),
            None => Input::Eof,
        }),
    }
}

enum Flow {
    Quit,
    Continue,
}

/// 内建命令；返回 None 表示普通消息
async fn handle_command(orchestrator: &Orchestrator, input: &str) -> Option<Flow> {
    let (cmd, arg) = match input.split_once(char::is_whitespace) {
        Some((c, rest)) => (c.to_lowercase(), rest.trim()),
        None => (input.to_lowercase(), ""),
    };

    match cmd.as_str() {
        "quit" | "exit" | "bye" if arg.is_empty() => Some(Flow::Quit),
        "memory" if arg.is_empty() => {
            let s = orchestrator.get_memory_summary();
            println!("\nMemory summary:");
            println!("Total conversations: {}", s.total_turns);
            println!("Recent topics: {:?}", s.recent_topics);
            println!("Session data: {:?}", s.session_keys);
            let (prompt, completion, total) = orchestrator.token_usage();
            println!("Tokens used: {} prompt + {} completion = {}\n", prompt, completion, total);
            Some(Flow::Continue)
        }
        "clear" if arg.is_empty() => {
            match orchestrator.clear_memory().await {
                Ok(()) => println!("Conversation history cleared!\n"),
                Err(e) => println!("Error: {}\n", e),
            }
            Some(Flow::Continue)
        }
        "export" | "import" if !arg.is_empty() => {
            let result = if cmd == "export" {
                orchestrator.export_memory(arg).await
            } else {
                orchestrator.import_memory(arg).await
            };
            match result {
                Ok(msg) => println!("{}\n", msg),
                Err(e) => println!("Error: {}\n", e),
            }
            Some(Flow::Continue)
        }
        _ => None,
    }
}
