/// Kind of element a collection holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionElement {
    Basic,
    Entity(String),
}

/// Mapping of one collection role to the rows that represent it
///
/// A join-table collection (basic elements or many-to-many) owns rows in
/// its own table. A one-to-many collection owns no rows: it maintains the
/// foreign key column on the child entity's table.
#[derive(Debug, Clone)]
pub struct CollectionPersister {
    role: String,
    table_name: String,
    key_column: String,
    element_column: String,
    element: CollectionElement,
    many_to_many: bool,
    inverse: bool,
}

impl CollectionPersister {
    pub fn new(role: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            table_name: table_name.into(),
            key_column: "owner_id".to_string(),
            element_column: "element".to_string(),
            element: CollectionElement::Basic,
            many_to_many: false,
            inverse: false,
        }
    }

    pub fn key_column(mut self, column: impl Into<String>) -> Self {
        self.key_column = column.into();
        self
    }

    pub fn element_column(mut self, column: impl Into<String>) -> Self {
        self.element_column = column.into();
        self
    }

    /// Elements are child entities whose table carries the key column.
    pub fn one_to_many(mut self, entity_name: impl Into<String>) -> Self {
        self.element = CollectionElement::Entity(entity_name.into());
        self.element_column = "id".to_string();
        self.many_to_many = false;
        self
    }

    /// Elements are entities linked through this persister's join table.
    pub fn many_to_many(mut self, entity_name: impl Into<String>) -> Self {
        self.element = CollectionElement::Entity(entity_name.into());
        self.many_to_many = true;
        self
    }

    /// The other side maintains the association; no rows are written here.
    pub fn inverse(mut self) -> Self {
        self.inverse = true;
        self
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn element(&self) -> &CollectionElement {
        &self.element
    }

    pub fn element_entity_name(&self) -> Option<&str> {
        match &self.element {
            CollectionElement::Entity(name) => Some(name),
            CollectionElement::Basic => None,
        }
    }

    pub fn is_many_to_many(&self) -> bool {
        self.many_to_many
    }

    pub fn is_one_to_many(&self) -> bool {
        !self.many_to_many && self.element_entity_name().is_some()
    }

    pub fn is_inverse(&self) -> bool {
        self.inverse
    }

    pub fn query_spaces(&self) -> Vec<String> {
        vec![self.table_name.clone()]
    }

    // ========================================================================
    // Statement rendering (parameters: key, element)
    // ========================================================================

    pub fn insert_row_sql(&self) -> String {
        if self.is_one_to_many() {
            format!(
                "UPDATE {} SET {} = ? WHERE {} = ?",
                self.table_name, self.key_column, self.element_column
            )
        } else {
            format!(
                "INSERT INTO {} ({}, {}) VALUES (?, ?)",
                self.table_name, self.key_column, self.element_column
            )
        }
    }

    pub fn delete_row_sql(&self) -> String {
        if self.is_one_to_many() {
            format!(
                "UPDATE {} SET {} = NULL WHERE {} = ? AND {} = ?",
                self.table_name, self.key_column, self.key_column, self.element_column
            )
        } else {
            format!(
                "DELETE FROM {} WHERE {} = ? AND {} = ?",
                self.table_name, self.key_column, self.element_column
            )
        }
    }

    /// Removes every row of one collection (parameter: key).
    pub fn delete_rows_sql(&self) -> String {
        if self.is_one_to_many() {
            format!(
                "UPDATE {} SET {} = NULL WHERE {} = ?",
                self.table_name, self.key_column, self.key_column
            )
        } else {
            format!("DELETE FROM {} WHERE {} = ?", self.table_name, self.key_column)
        }
    }
}
