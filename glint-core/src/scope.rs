use std::collections::HashMap;

/// A single scope containing named bindings.
#[derive(Debug, Clone)]
pub struct Scope<T> {
    bindings: HashMap<String, T>,
}

impl<T> Default for Scope<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Scope<T> {
    pub fn new() -> Self {
        Scope {
            bindings: HashMap::new(),
        }
    }

    pub fn insert(&mut self, name: String, value: T) {
        self.bindings.insert(name, value);
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.bindings.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut T> {
        self.bindings.get_mut(name)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }
}

/// A stack of scopes tracking lexical nesting.
///
/// Declarations are checked against the current *and every enclosing*
/// scope: the language does not permit shadowing, so `declare` fails on
/// any collision up the chain. Lookup walks innermost to outermost.
#[derive(Debug, Clone)]
pub struct ScopeStack<T> {
    scopes: Vec<Scope<T>>,
}

impl<T> Default for ScopeStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ScopeStack<T> {
    /// Create a new scope stack with a global scope.
    pub fn new() -> Self {
        ScopeStack {
            scopes: vec![Scope::new()],
        }
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(Scope::new());
    }

    /// Pop the current scope. Returns None if trying to pop the global
    /// scope; the stack is strictly LIFO and never underflows.
    pub fn pop_scope(&mut self) -> Option<Scope<T>> {
        if self.scopes.len() > 1 {
            self.scopes.pop()
        } else {
            None
        }
    }

    /// Declare a binding in the current scope. Fails if the name exists
    /// in the current or any enclosing scope (no shadowing).
    pub fn declare(&mut self, name: &str, value: T) -> Result<(), String> {
        if self.is_defined(name) {
            return Err(format!("Redeclaration of '{}'", name));
        }
        self.insert(name.to_string(), value);
        Ok(())
    }

    /// Insert without the collision check. Used for bindings whose
    /// duplication is handled by the caller, e.g. a function definition
    /// updating its own declaration.
    pub fn insert(&mut self, name: String, value: T) {
        if let Some(current) = self.scopes.last_mut() {
            current.insert(name, value);
        }
    }

    /// Look up a binding, searching from innermost to outermost scope.
    pub fn lookup(&self, name: &str) -> Option<&T> {
        self.scopes.iter().rev().find_map(|s| s.get(name))
    }

    pub fn lookup_mut(&mut self, name: &str) -> Option<&mut T> {
        self.scopes.iter_mut().rev().find_map(|s| s.get_mut(name))
    }

    pub fn is_defined_in_current_scope(&self, name: &str) -> bool {
        self.scopes.last().map_or(false, |s| s.contains_key(name))
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.scopes.iter().rev().any(|s| s.contains_key(name))
    }

    /// Current scope depth (0 = global scope).
    pub fn depth(&self) -> usize {
        self.scopes.len().saturating_sub(1)
    }
}
