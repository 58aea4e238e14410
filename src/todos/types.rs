use serde::{Deserialize, Serialize};

/// A todo item as returned by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub completed: bool,
}

impl Todo {
    /// Copy with `completed` flipped.
    #[must_use]
    pub fn toggled(&self) -> Todo {
        Todo {
            completed: !self.completed,
            ..self.clone()
        }
    }
}

/// Body of a create or update request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTodo {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub completed: bool,
}

impl NewTodo {
    pub fn new(title: impl Into<String>) -> Self {
        NewTodo {
            title: title.into(),
            description: None,
            completed: false,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl From<&Todo> for NewTodo {
    fn from(todo: &Todo) -> Self {
        NewTodo {
            title: todo.title.clone(),
            description: todo.description.clone(),
            completed: todo.completed,
        }
    }
}

/// Username and password, sent form-encoded to log in and as JSON to register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Bearer token issued on login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredUser {
    pub id: i64,
    pub username: String,
}

/// Confirmation returned by a delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deleted {
    pub message: String,
}
