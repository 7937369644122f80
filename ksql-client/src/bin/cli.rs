//! ksql-cli - Interactive client for ksqlDB servers

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use comfy_table::{
    modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, CellAlignment, Color,
    ContentArrangement, Table,
};
use ksql_client::{
    CollectingSink, DispatchConfig, Dispatcher, HttpTransportFactory, OutputRecord, Request,
    StreamHandle,
};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing_subscriber::EnvFilter;

/// ksql-cli - Interactive client for ksqlDB
#[derive(Parser, Debug)]
#[command(name = "ksql-cli")]
#[command(about = "Interactive client for ksqlDB REST servers", long_about = None)]
struct Args {
    /// ksqlDB server endpoint (overrides KSQL_DISPATCH_ENDPOINT)
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Statement to execute (if provided, runs in non-interactive mode)
    #[arg(short, long)]
    query: Option<String>,

    /// Query time limit in seconds; 0 streams until Ctrl-C
    #[arg(short, long, default_value_t = 15)]
    timeout: u64,

    /// Streams property sent with every request, as key=value
    #[arg(short, long = "property", value_parser = parse_property)]
    properties: Vec<(String, String)>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = DispatchConfig::load()?;
    if let Some(endpoint) = args.endpoint.clone() {
        config.endpoint = endpoint;
        config.validate()?;
    }
    init_tracing(&config, args.debug);

    let sink = Arc::new(CollectingSink::new());
    let dispatcher = Dispatcher::with_config(
        Arc::new(HttpTransportFactory::from_config(&config)),
        sink.clone(),
        &config,
    );
    let mut session = Session {
        dispatcher,
        sink,
        endpoint: config.endpoint.clone(),
        timeout: Duration::from_secs(args.timeout),
        properties: args.properties,
    };

    println!("Using ksqlDB at {}\n", session.endpoint);
    let result = match args.query {
        Some(query) => session.execute_and_display(&query).await,
        None => session.interactive_mode(args.debug).await,
    };
    session.dispatcher.close();
    result
}

fn init_tracing(config: &DispatchConfig, debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if config.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn parse_property(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("property {raw:?} must look like key=value"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow!("property {raw:?} has an empty key"));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

const PROMPT: &str = "ksql> ";
const CONTINUATION_PROMPT: &str = "   -> ";

const HELP: &str = "\
Statements end with ';' and may span several lines.
  \\t <secs>        set the query time limit (0 streams until Ctrl-C)
  \\p <key=value>   add a streams property to every request
  \\s               show current settings
  \\h               show this help
  exit | quit | \\q  leave the shell";

/// A complete line of shell input.
#[derive(Debug, PartialEq, Eq)]
enum ShellInput {
    Quit,
    Help,
    Settings,
    Timeout(Duration),
    Property(String, String),
    /// Statement text, possibly still missing its terminating `;`.
    Statement(String),
}

fn parse_shell_input(line: &str) -> Result<Option<ShellInput>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit") {
        return Ok(Some(ShellInput::Quit));
    }
    let Some(command) = line.strip_prefix('\\') else {
        return Ok(Some(ShellInput::Statement(line.to_string())));
    };
    let (name, arg) = command
        .split_once(char::is_whitespace)
        .map_or((command, ""), |(name, arg)| (name, arg.trim()));
    let input = match name {
        "q" => ShellInput::Quit,
        "h" | "?" => ShellInput::Help,
        "s" => ShellInput::Settings,
        "t" => {
            let secs: u64 = arg
                .parse()
                .with_context(|| format!("\\t expects whole seconds, got {arg:?}"))?;
            ShellInput::Timeout(Duration::from_secs(secs))
        }
        "p" => {
            let (key, value) = parse_property(arg)?;
            ShellInput::Property(key, value)
        }
        other => return Err(anyhow!("unknown command \\{other}; try \\h")),
    };
    Ok(Some(input))
}

struct Session {
    dispatcher: Dispatcher,
    sink: Arc<CollectingSink>,
    endpoint: String,
    timeout: Duration,
    properties: Vec<(String, String)>,
}

impl Session {
    async fn interactive_mode(&mut self, debug: bool) -> Result<()> {
        println!("ksqlDB shell. Type \\h for help.");
        println!("A zero time limit turns SELECT into a push query; Ctrl-C stops it.\n");

        let mut rl = DefaultEditor::new()?;
        let history_file = dirs::home_dir().map(|home| home.join(".ksql_dispatch_history"));
        if let Some(path) = history_file.as_deref().filter(|p| p.exists()) {
            let _ = rl.load_history(path);
        }

        let mut pending = String::new();
        let mut interrupted = false;

        loop {
            let prompt = if pending.is_empty() { PROMPT } else { CONTINUATION_PROMPT };
            let line = match tokio::task::block_in_place(|| rl.readline(prompt)) {
                Ok(line) => line,
                Err(ReadlineError::Interrupted) if !pending.is_empty() => {
                    pending.clear();
                    println!("(statement discarded)");
                    continue;
                }
                Err(ReadlineError::Interrupted) if !interrupted => {
                    interrupted = true;
                    println!("^C (press Ctrl-C again to exit)");
                    continue;
                }
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
                Err(err) => {
                    eprintln!("Error reading input: {err}");
                    break;
                }
            };
            interrupted = false;

            if !pending.is_empty() {
                pending.push('\n');
                pending.push_str(line.trim());
                if !pending.ends_with(';') {
                    continue;
                }
                let statement = std::mem::take(&mut pending);
                let _ = rl.add_history_entry(statement.as_str());
                self.run_reporting(&statement, debug).await;
                continue;
            }

            let input = match parse_shell_input(&line) {
                Ok(Some(input)) => input,
                Ok(None) => continue,
                Err(err) => {
                    eprintln!("{err}");
                    continue;
                }
            };
            let _ = rl.add_history_entry(line.trim());
            match input {
                ShellInput::Quit => break,
                ShellInput::Help => println!("{HELP}"),
                ShellInput::Settings => self.print_settings(),
                ShellInput::Timeout(timeout) => {
                    self.timeout = timeout;
                    self.print_settings();
                }
                ShellInput::Property(key, value) => {
                    self.properties.retain(|(existing, _)| *existing != key);
                    self.properties.push((key, value));
                }
                ShellInput::Statement(text) if text.ends_with(';') => {
                    self.run_reporting(&text, debug).await;
                }
                ShellInput::Statement(text) => pending = text,
            }
        }

        println!("Goodbye!");
        if let Some(path) = history_file {
            let _ = rl.save_history(&path);
        }
        Ok(())
    }

    async fn run_reporting(&self, statement: &str, debug: bool) {
        if let Err(e) = self.execute_and_display(statement).await {
            eprintln!("Error: {e}");
            if debug {
                eprintln!("Details: {e:?}");
            }
        }
        println!();
    }

    fn print_settings(&self) {
        let limit = if self.timeout.is_zero() {
            "none (SELECT streams)".to_string()
        } else {
            format!("{}s", self.timeout.as_secs())
        };
        println!("endpoint:   {}", self.endpoint);
        println!("time limit: {limit}");
        for (key, value) in &self.properties {
            println!("property:   {key}={value}");
        }
    }

    async fn execute_and_display(&self, statement: &str) -> Result<()> {
        let start = Instant::now();
        let request = Request::new(statement).with_properties(self.properties.clone());

        let stream = self
            .dispatcher
            .dispatch(&request, &self.endpoint, self.timeout)
            .await
            .context("statement failed")?;

        match stream {
            Some(stream) => self.follow_stream(stream).await?,
            None => {
                let records = self.sink.drain();
                if records.is_empty() {
                    println!("(No output)");
                } else {
                    display_records(&records);
                }
            }
        }
        println!("{:.3}s", start.elapsed().as_secs_f64());
        Ok(())
    }

    /// Print rows as they arrive until the stream closes or Ctrl-C.
    async fn follow_stream(&self, stream: StreamHandle) -> Result<()> {
        println!("Streaming; press Ctrl-C to stop.");
        let mut tick = tokio::time::interval(Duration::from_millis(100));
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                _ = &mut ctrl_c, if !stream.is_cancelled() => stream.cancel(),
                _ = tick.tick() => {
                    for record in self.sink.drain() {
                        println!("{record}");
                    }
                    if stream.is_finished() {
                        break;
                    }
                }
            }
        }

        let outcome = stream.join().await?;
        for record in self.sink.drain() {
            println!("{record}");
        }
        println!(
            "{} record{} ({:?})",
            outcome.records,
            if outcome.records == 1 { "" } else { "s" },
            outcome.exit
        );
        Ok(())
    }
}

fn display_records(records: &[OutputRecord]) {
    let rows: Vec<&OutputRecord> = records
        .iter()
        .filter(|r| matches!(r, OutputRecord::Row { .. }))
        .collect();
    if !rows.is_empty() {
        println!("{}", rows_table(&rows));
        println!(
            "{} row{}",
            rows.len(),
            if rows.len() == 1 { "" } else { "s" }
        );
    }

    let mut topics = new_table(&["Topic", "Registered", "Consumers", "Group consumers"]);
    let mut streams = new_table(&["Stream", "Topic", "Format"]);
    let mut tables = new_table(&["Table", "Topic", "Format", "Windowed"]);
    for record in records {
        match record {
            OutputRecord::Topic(t) => {
                topics.add_row(vec![
                    Cell::new(&t.name),
                    Cell::new(t.registered),
                    Cell::new(t.consumer_count),
                    Cell::new(t.consumer_group_count),
                ]);
            }
            OutputRecord::Stream(s) => {
                streams.add_row(vec![
                    Cell::new(&s.name),
                    Cell::new(&s.topic),
                    Cell::new(&s.format),
                ]);
            }
            OutputRecord::Table(t) => {
                tables.add_row(vec![
                    Cell::new(&t.name),
                    Cell::new(&t.topic),
                    Cell::new(&t.format),
                    Cell::new(t.is_windowed),
                ]);
            }
            _ => {}
        }
    }
    for table in [topics, streams, tables] {
        if table.row_iter().next().is_some() {
            println!("{table}");
        }
    }

    for record in records.iter().filter(|r| r.is_status()) {
        println!("{record}");
    }
}

fn rows_table(rows: &[&OutputRecord]) -> Table {
    let width = rows
        .iter()
        .map(|r| match r {
            OutputRecord::Row { values, .. } => values.len(),
            _ => 0,
        })
        .max()
        .unwrap_or(0);
    let annotated = rows
        .iter()
        .any(|r| matches!(r, OutputRecord::Row { annotation: Some(_), .. }));

    let mut header: Vec<String> = (1..=width).map(|i| format!("col{i}")).collect();
    if annotated {
        header.push("note".to_string());
    }
    let header_refs: Vec<&str> = header.iter().map(String::as_str).collect();
    let mut table = new_table(&header_refs);

    for row in rows {
        if let OutputRecord::Row { values, annotation } = row {
            let mut cells: Vec<Cell> = values.iter().map(|v| Cell::new(&v.text)).collect();
            cells.resize_with(width, || Cell::new(""));
            if annotated {
                cells.push(Cell::new(annotation.as_deref().unwrap_or("")));
            }
            table.add_row(cells);
        }
    }
    table
}

fn new_table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.iter().map(|name| {
            Cell::new(name)
                .fg(Color::Cyan)
                .set_alignment(CellAlignment::Center)
        }));
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_splits_on_first_equals() {
        assert_eq!(
            parse_property("ksql.streams.auto.offset.reset=earliest").unwrap(),
            (
                "ksql.streams.auto.offset.reset".to_string(),
                "earliest".to_string()
            )
        );
        assert_eq!(
            parse_property("a=b=c").unwrap(),
            ("a".to_string(), "b=c".to_string())
        );
    }

    #[test]
    fn shell_commands_are_recognised() {
        assert_eq!(parse_shell_input("   ").unwrap(), None);
        assert_eq!(parse_shell_input("QUIT").unwrap(), Some(ShellInput::Quit));
        assert_eq!(parse_shell_input("\\q").unwrap(), Some(ShellInput::Quit));
        assert_eq!(
            parse_shell_input("\\t 0").unwrap(),
            Some(ShellInput::Timeout(Duration::ZERO))
        );
        assert_eq!(
            parse_shell_input("\\p ksql.streams.auto.offset.reset = earliest").unwrap(),
            Some(ShellInput::Property(
                "ksql.streams.auto.offset.reset".to_string(),
                "earliest".to_string()
            ))
        );
    }

    #[test]
    fn statements_pass_through_untouched() {
        assert_eq!(
            parse_shell_input("  SELECT * FROM users\n").unwrap(),
            Some(ShellInput::Statement("SELECT * FROM users".to_string()))
        );
    }

    #[test]
    fn bad_shell_commands_are_rejected() {
        assert!(parse_shell_input("\\t soon").is_err());
        assert!(parse_shell_input("\\p novalue").is_err());
        assert!(parse_shell_input("\\x").is_err());
    }

    #[test]
    fn property_requires_key_and_separator() {
        assert!(parse_property("novalue").is_err());
        assert!(parse_property("=earliest").is_err());
    }
}
