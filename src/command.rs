//! Shell commands.
//!
//! This module defines the [`Command`] enum, which encapsulates the commands understood by the
//! `docwire_cli` shell, and the parser that builds one from a line of user input. A parsed
//! command is run against a [`Database`] handle with [`Command::execute`].
//!
//! # Overview
//!
//! - `.exit`: Close the session.
//! - `ping`: Round trip a `ping` command to the server.
//! - `count <collection>`: Count the documents of a collection.
//! - `find <collection> [field=value ...]`: Print the documents matching an equality filter.
//! - `insert <collection> field=value ...`: Insert one document.
//! - `remove <collection> [field=value ...]`: Remove the matching documents.
//!
//! Values are read as integers, then booleans, and otherwise kept as strings.
//!
//! # Example
//! ```rust
//! use bson::doc;
//! use docwire::Command;
//!
//! let cmd = Command::try_from("find users name=ana").unwrap();
//! assert_eq!(
//!     cmd,
//!     Command::Find { collection: "users".to_string(), filter: doc! { "name": "ana" } }
//! );
//! ```
use bson::{Bson, Document, doc};
use thiserror::Error;

use crate::{
    collection::{FindOptions, WriteOptions},
    database::Database,
    error::Result,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("unrecognized command '{0}'")]
    UnrecognizedCommand(String),

    #[error("invalid '{command}' command, {reason}")]
    InvalidCommandArguments { command: String, reason: String },

    #[error("invalid field '{0}', expected field=value")]
    InvalidField(String),

    #[error("no command provided")]
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Close the session and terminate the process.
    Exit,
    Ping,
    Count { collection: String },
    Find { collection: String, filter: Document },
    Insert { collection: String, document: Document },
    Remove { collection: String, filter: Document },
}

impl TryFrom<&str> for Command {
    type Error = CommandError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let mut parts = value.split_whitespace();
        let Some(name) = parts.next() else {
            return Err(CommandError::Empty);
        };

        match name.to_lowercase().as_str() {
            ".exit" => Ok(Command::Exit),
            "ping" => Ok(Command::Ping),
            "count" => Ok(Command::Count {
                collection: collection_arg("count", parts.next())?,
            }),
            "find" => Ok(Command::Find {
                collection: collection_arg("find", parts.next())?,
                filter: fields(parts)?,
            }),
            "remove" => Ok(Command::Remove {
                collection: collection_arg("remove", parts.next())?,
                filter: fields(parts)?,
            }),
            "insert" => {
                let collection = collection_arg("insert", parts.next())?;
                let document = fields(parts)?;
                if document.is_empty() {
                    return Err(CommandError::InvalidCommandArguments {
                        command: "insert".to_string(),
                        reason: "requires at least one field. Example: insert users name=ana"
                            .to_string(),
                    });
                }
                Ok(Command::Insert {
                    collection,
                    document,
                })
            }
            _ => Err(CommandError::UnrecognizedCommand(value.trim().to_string())),
        }
    }
}

fn collection_arg(command: &str, arg: Option<&str>) -> Result<String, CommandError> {
    arg.map(str::to_string)
        .ok_or_else(|| CommandError::InvalidCommandArguments {
            command: command.to_string(),
            reason: format!("requires a collection name. Example: {command} users"),
        })
}

fn fields<'a>(parts: impl Iterator<Item = &'a str>) -> Result<Document, CommandError> {
    let mut document = Document::new();
    for part in parts {
        let (key, raw) = part
            .split_once('=')
            .filter(|(key, _)| !key.is_empty())
            .ok_or_else(|| CommandError::InvalidField(part.to_string()))?;
        document.insert(key, parse_value(raw));
    }
    Ok(document)
}

fn parse_value(raw: &str) -> Bson {
    if let Ok(n) = raw.parse::<i64>() {
        return match i32::try_from(n) {
            Ok(n) => Bson::Int32(n),
            Err(_) => Bson::Int64(n),
        };
    }
    match raw {
        "true" => Bson::Boolean(true),
        "false" => Bson::Boolean(false),
        s => Bson::String(s.to_string()),
    }
}

impl Command {
    /// Run the command, returning the lines to show the user.
    pub async fn execute(&self, database: &Database, write: WriteOptions) -> Result<Vec<String>> {
        match self {
            Command::Exit => Ok(Vec::new()),
            Command::Ping => {
                database.command(doc! { "ping": 1 }).await?;
                Ok(vec!["pong".to_string()])
            }
            Command::Count { collection } => {
                let n = database.collection(collection).count(doc! {}).await?;
                Ok(vec![n.to_string()])
            }
            Command::Find { collection, filter } => {
                let found = database
                    .collection(collection)
                    .find(filter.clone(), FindOptions::default())
                    .await?;
                Ok(found.iter().map(Document::to_string).collect())
            }
            Command::Insert {
                collection,
                document,
            } => {
                let id = database
                    .collection(collection)
                    .insert_one(document.clone(), write)
                    .await?;
                Ok(vec![format!("inserted {id}")])
            }
            Command::Remove { collection, filter } => {
                let status = database
                    .collection(collection)
                    .remove(filter.clone(), write)
                    .await?;
                Ok(match status {
                    Some(status) => vec![format!("removed {}", status.get("n").unwrap_or(&Bson::Null))],
                    None => vec!["remove sent".to_string()],
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::spawn_test_server;

    #[test]
    fn command_from_string() {
        let inputs = vec![
            (".exit", Command::Exit),
            ("  PING ", Command::Ping),
            (
                "count users",
                Command::Count {
                    collection: "users".to_string(),
                },
            ),
            (
                "find users",
                Command::Find {
                    collection: "users".to_string(),
                    filter: doc! {},
                },
            ),
            (
                "insert users name=ana age=31 admin=true big=5000000000",
                Command::Insert {
                    collection: "users".to_string(),
                    document: doc! { "name": "ana", "age": 31, "admin": true, "big": 5_000_000_000i64 },
                },
            ),
            (
                "remove users name=ana",
                Command::Remove {
                    collection: "users".to_string(),
                    filter: doc! { "name": "ana" },
                },
            ),
        ];

        for (input, expected) in inputs {
            assert_eq!(Command::try_from(input).unwrap(), expected);
        }
    }

    #[test]
    fn invalid_commands() {
        assert_eq!(Command::try_from("   "), Err(CommandError::Empty));
        assert_eq!(
            Command::try_from("select *"),
            Err(CommandError::UnrecognizedCommand("select *".to_string()))
        );
        assert!(matches!(
            Command::try_from("count"),
            Err(CommandError::InvalidCommandArguments { .. })
        ));
        assert!(matches!(
            Command::try_from("insert users"),
            Err(CommandError::InvalidCommandArguments { .. })
        ));
        assert_eq!(
            Command::try_from("find users name"),
            Err(CommandError::InvalidField("name".to_string()))
        );
    }

    #[tokio::test]
    async fn execute_against_server() {
        let address = spawn_test_server().await;
        let db = Database::connect([address.to_string()], "shell").await.unwrap();
        let run = |line: &str| Command::try_from(line).unwrap();

        assert_eq!(run("ping").execute(&db, WriteOptions::default()).await.unwrap(), vec!["pong"]);

        run("insert users _id=1 name=ana")
            .execute(&db, WriteOptions::default())
            .await
            .unwrap();
        run("insert users _id=2 name=bo")
            .execute(&db, WriteOptions::default())
            .await
            .unwrap();
        assert_eq!(run("count users").execute(&db, WriteOptions::default()).await.unwrap(), vec!["2"]);

        let found = run("find users name=bo").execute(&db, WriteOptions::default()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].contains("bo"));

        let removed = run("remove users").execute(&db, WriteOptions::default()).await.unwrap();
        assert_eq!(removed, vec!["removed 2"]);
        assert_eq!(run("count users").execute(&db, WriteOptions::default()).await.unwrap(), vec!["0"]);
    }
}
