use std::{sync::Arc, thread};

use anyhow::{anyhow, Result};
use dialoguer::{theme::ColorfulTheme, BasicHistory, Input};
use prettytable::{Cell, Row, Table};

use crate::{
    buffer::BufferPool,
    common::{PageID, Permission, TransactionID},
    page::Page,
};

const HELP: &str = r#"commands:
  begin
  lock <txn> <table> <page> s|x
  unlock <txn> <table> <page>
  read <txn> <table> <page>
  write <txn> <table> <page> <text>
  commit <txn> | abort <txn> | interrupt <txn>
  discard <table> <page>
  locks | cache | help | exit"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Begin,
    Lock(TransactionID, PageID, Permission),
    Unlock(TransactionID, PageID),
    Read(TransactionID, PageID),
    Write(TransactionID, PageID, String),
    Commit(TransactionID),
    Abort(TransactionID),
    Interrupt(TransactionID),
    Discard(PageID),
    Locks,
    Cache,
    Help,
    Exit,
}

pub fn parse_command(line: &str) -> Result<Command> {
    let words = line.split_whitespace().collect::<Vec<_>>();
    let Some((&name, args)) = words.split_first() else {
        return Err(anyhow!("empty command"));
    };
    let command = match (name.to_lowercase().as_str(), args) {
        ("begin", []) => Command::Begin,
        ("lock", [txn, table, page, mode]) => Command::Lock(
            parse_txn(txn)?,
            parse_page(table, page)?,
            parse_permission(mode)?,
        ),
        ("unlock", [txn, table, page]) => Command::Unlock(parse_txn(txn)?, parse_page(table, page)?),
        ("read", [txn, table, page]) => Command::Read(parse_txn(txn)?, parse_page(table, page)?),
        ("write", [txn, table, page, text @ ..]) if !text.is_empty() => Command::Write(
            parse_txn(txn)?,
            parse_page(table, page)?,
            text.join(" "),
        ),
        ("commit", [txn]) => Command::Commit(parse_txn(txn)?),
        ("abort", [txn]) => Command::Abort(parse_txn(txn)?),
        ("interrupt", [txn]) => Command::Interrupt(parse_txn(txn)?),
        ("discard", [table, page]) => Command::Discard(parse_page(table, page)?),
        ("locks", []) => Command::Locks,
        ("cache", []) => Command::Cache,
        ("help", []) => Command::Help,
        ("exit", []) | ("quit", []) => Command::Exit,
        _ => return Err(anyhow!("invalid command: {}", line.trim())),
    };
    Ok(command)
}

fn parse_txn(word: &str) -> Result<TransactionID> {
    let digits = word
        .strip_prefix('T')
        .or_else(|| word.strip_prefix('t'))
        .unwrap_or(word);
    Ok(TransactionID(
        digits
            .parse()
            .map_err(|_| anyhow!("invalid transaction: {}", word))?,
    ))
}

fn parse_page(table: &str, page: &str) -> Result<PageID> {
    let table_id = table
        .parse()
        .map_err(|_| anyhow!("invalid table id: {}", table))?;
    let page_number = page
        .parse()
        .map_err(|_| anyhow!("invalid page number: {}", page))?;
    Ok(PageID(table_id, page_number))
}

fn parse_permission(word: &str) -> Result<Permission> {
    match word.to_lowercase().as_str() {
        "s" | "shared" => Ok(Permission::Shared),
        "x" | "exclusive" => Ok(Permission::Exclusive),
        _ => Err(anyhow!("invalid lock mode: {}", word)),
    }
}

pub struct Console {
    pool: Arc<BufferPool>,
}

impl Console {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self { pool }
    }

    pub fn start(&self) -> Result<()> {
        println!(
            "pagelock console (cache capacity {})",
            self.pool.capacity()
        );
        println!("Type \"help\" for commands, \"exit\" or \"quit\" to exit.");
        let mut history = BasicHistory::new().max_entries(100).no_duplicates(true);
        loop {
            let line = Input::<String>::with_theme(&ColorfulTheme::default())
                .with_prompt("pagelock")
                .history_with(&mut history)
                .interact_text()?;
            match parse_command(&line) {
                Ok(Command::Exit) => {
                    println!("Bye!");
                    return self.pool.flush_all();
                }
                Ok(command) => match self.execute(command) {
                    Ok(response) => println!("{}", response),
                    Err(e) => println!("error: {}", e),
                },
                Err(e) => println!("error: {}", e),
            }
        }
    }

    /// Runs one command. Requests that may block on a lock run on their own
    /// thread and report when they finish.
    pub fn execute(&self, command: Command) -> Result<String> {
        let pool = &self.pool;
        match command {
            Command::Begin => Ok(format!("{} started", pool.begin()?)),
            Command::Lock(txn_id, page_id, permission) => Ok(self.spawn(txn_id, move |pool| {
                pool.acquire_lock(txn_id, page_id, permission)?;
                Ok(format!("{} locked {} ({})", txn_id, page_id, permission))
            })),
            Command::Unlock(txn_id, page_id) => {
                pool.release_lock(txn_id, page_id)?;
                Ok(format!("{} unlocked {}", txn_id, page_id))
            }
            Command::Read(txn_id, page_id) => Ok(self.spawn(txn_id, move |pool| {
                let page = pool.get_page(txn_id, page_id, Permission::Shared)?;
                Ok(format!("{} read {}: {:?}", txn_id, page_id, text_of(page.data())))
            })),
            Command::Write(txn_id, page_id, text) => Ok(self.spawn(txn_id, move |pool| {
                let mut page = pool.get_page(txn_id, page_id, Permission::Exclusive)?;
                let mut bytes = text.into_bytes();
                bytes.push(0);
                page.write(0, &bytes);
                pool.write_page(txn_id, page)?;
                Ok(format!("{} wrote {}", txn_id, page_id))
            })),
            Command::Commit(txn_id) => {
                pool.commit(txn_id)?;
                Ok(format!("{} committed", txn_id))
            }
            Command::Abort(txn_id) => {
                pool.abort(txn_id)?;
                Ok(format!("{} aborted", txn_id))
            }
            Command::Interrupt(txn_id) => Ok(if pool.interrupt(txn_id)? {
                format!("{} interrupted", txn_id)
            } else {
                format!("{} is not waiting", txn_id)
            }),
            Command::Discard(page_id) => {
                pool.discard_page(page_id)?;
                Ok(format!("{} discarded", page_id))
            }
            Command::Locks => self.render_locks(),
            Command::Cache => self.render_cache(),
            Command::Help => Ok(HELP.to_string()),
            Command::Exit => Ok("Bye!".to_string()),
        }
    }

    fn spawn<F>(&self, txn_id: TransactionID, request: F) -> String
    where
        F: FnOnce(&BufferPool) -> Result<String> + Send + 'static,
    {
        let pool = self.pool.clone();
        thread::spawn(move || match request(pool.as_ref()) {
            Ok(response) => println!("{}", response),
            Err(e) => println!("{}: error: {}", txn_id, e),
        });
        format!("{} request submitted", txn_id)
    }

    fn render_locks(&self) -> Result<String> {
        let lock_table = self.pool.lock_manager().lock_table()?;
        let mut table_view = Table::new();
        table_view.set_titles(Row::new(vec![
            Cell::new("page"),
            Cell::new("writer"),
            Cell::new("readers"),
            Cell::new("waiting"),
        ]));
        let waiters = self.pool.lock_manager().waiters()?;
        for (page_id, writer, readers) in lock_table {
            let waiting = waiters
                .iter()
                .filter(|(_, waited)| *waited == page_id)
                .map(|(txn_id, _)| *txn_id)
                .collect::<Vec<_>>();
            table_view.add_row(Row::new(vec![
                Cell::new(&page_id.to_string()),
                Cell::new(&writer.map(|w| w.to_string()).unwrap_or_default()),
                Cell::new(&join(&readers)),
                Cell::new(&join(&waiting)),
            ]));
        }
        Ok(table_view.to_string())
    }

    fn render_cache(&self) -> Result<String> {
        let mut table_view = Table::new();
        table_view.set_titles(Row::new(vec![
            Cell::new("page"),
            Cell::new("state"),
            Cell::new("dirtied by"),
            Cell::new("data"),
        ]));
        for page in self.pool.cache_snapshot()? {
            table_view.add_row(Row::new(vec![
                Cell::new(&page.page_id().to_string()),
                Cell::new("cached"),
                Cell::new(&page.dirtied_by().map(|t| t.to_string()).unwrap_or_default()),
                Cell::new(&text_of(page.data())),
            ]));
        }
        for page_id in self.pool.pending_eviction()? {
            table_view.add_row(Row::new(vec![
                Cell::new(&page_id.to_string()),
                Cell::new("set aside"),
                Cell::new(""),
                Cell::new(""),
            ]));
        }
        Ok(table_view.to_string())
    }
}

fn join(txn_ids: &[TransactionID]) -> String {
    txn_ids
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn text_of(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).to_string()
}
