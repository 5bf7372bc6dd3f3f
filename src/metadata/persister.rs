use super::types::{ComponentType, Type};
use crate::core::Value;

/// How an entity obtains its identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierGeneration {
    /// Set by the application (or a generator) before the insert is queued.
    Assigned,
    /// Generated by the database on insert; the insert runs immediately.
    Identity,
}

/// One mapped property of an entity
#[derive(Debug, Clone)]
pub struct Property {
    name: String,
    column: String,
    ty: Type,
    nullable: bool,
    cascade: bool,
}

impl Property {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        let name = name.into();
        Self {
            column: name.clone(),
            name,
            ty,
            nullable: true,
            cascade: false,
        }
    }

    pub fn basic(name: impl Into<String>) -> Self {
        Self::new(name, Type::Basic)
    }

    pub fn many_to_one(name: impl Into<String>, entity_name: impl Into<String>) -> Self {
        let property = Self::new(name, Type::many_to_one(entity_name));
        let column = format!("{}_id", property.name);
        property.column(column)
    }

    pub fn collection(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self::new(name, Type::collection(role))
    }

    pub fn component(name: impl Into<String>, component: ComponentType) -> Self {
        Self::new(name, Type::Component(component))
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Persisting the owner also persists the transient entities this
    /// property references.
    pub fn cascade(mut self) -> Self {
        self.cascade = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column_name(&self) -> &str {
        &self.column
    }

    pub fn ty(&self) -> &Type {
        &self.ty
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn is_cascaded(&self) -> bool {
        self.cascade
    }
}

/// Mapping of one entity to its table, plus the statements written for it
#[derive(Debug, Clone)]
pub struct EntityPersister {
    entity_name: String,
    root_entity_name: String,
    table_name: String,
    id_column: String,
    identifier_type: Type,
    generation: IdentifierGeneration,
    properties: Vec<Property>,
    query_spaces: Vec<String>,
    mutable: bool,
}

impl EntityPersister {
    pub fn new(entity_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        let entity_name = entity_name.into();
        let table_name = table_name.into();
        Self {
            root_entity_name: entity_name.clone(),
            entity_name,
            query_spaces: vec![table_name.clone()],
            table_name,
            id_column: "id".to_string(),
            identifier_type: Type::Basic,
            generation: IdentifierGeneration::Assigned,
            properties: Vec::new(),
            mutable: true,
        }
    }

    /// Declares this entity a subclass within the hierarchy rooted at `root`.
    pub fn root_entity(mut self, root: impl Into<String>) -> Self {
        self.root_entity_name = root.into();
        self
    }

    pub fn identifier(mut self, column: impl Into<String>, generation: IdentifierGeneration) -> Self {
        self.id_column = column.into();
        self.generation = generation;
        self
    }

    pub fn composite_identifier(mut self, component: ComponentType) -> Self {
        self.identifier_type = Type::Component(component);
        self
    }

    pub fn property(mut self, property: Property) -> Self {
        self.properties.push(property);
        self
    }

    /// Adds a query space besides the entity's own table.
    pub fn query_space(mut self, space: impl Into<String>) -> Self {
        self.query_spaces.push(space.into());
        self
    }

    pub fn immutable(mut self) -> Self {
        self.mutable = false;
        self
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn root_entity_name(&self) -> &str {
        &self.root_entity_name
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn identifier_type(&self) -> &Type {
        &self.identifier_type
    }

    pub fn uses_identity(&self) -> bool {
        self.generation == IdentifierGeneration::Identity
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn property_types(&self) -> Vec<&Type> {
        self.properties.iter().map(Property::ty).collect()
    }

    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name() == name)
    }

    pub fn query_spaces(&self) -> &[String] {
        &self.query_spaces
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    // ========================================================================
    // Statement rendering
    // ========================================================================

    fn columns(&self) -> Vec<String> {
        fn collect(prefix: &str, ty: &Type, out: &mut Vec<String>) {
            match ty {
                Type::Basic | Type::Entity(_) => out.push(prefix.to_string()),
                Type::Collection(_) => {}
                Type::Component(component) => {
                    for (name, sub) in component.property_names().iter().zip(component.subtypes()) {
                        collect(&format!("{}_{}", prefix, name), sub, out);
                    }
                }
            }
        }

        let mut columns = Vec::new();
        for property in &self.properties {
            collect(property.column_name(), property.ty(), &mut columns);
        }
        columns
    }

    /// Flattens a state array into the parameters bound for `columns()`.
    pub fn dehydrate(&self, state: &[Value]) -> Vec<Value> {
        fn collect(ty: &Type, value: Option<&Value>, out: &mut Vec<Value>) {
            match ty {
                Type::Basic | Type::Entity(_) => {
                    out.push(value.map(Value::to_parameter).unwrap_or(Value::Null))
                }
                Type::Collection(_) => {}
                Type::Component(component) => {
                    let values = match value {
                        Some(Value::Component(values)) => Some(values),
                        _ => None,
                    };
                    for (i, sub) in component.subtypes().iter().enumerate() {
                        collect(sub, values.and_then(|v| v.get(i)), out);
                    }
                }
            }
        }

        let mut params = Vec::new();
        for (i, property) in self.properties.iter().enumerate() {
            collect(property.ty(), state.get(i), &mut params);
        }
        params
    }

    pub fn insert_sql(&self, include_identifier: bool) -> String {
        let mut columns = self.columns();
        if include_identifier {
            columns.insert(0, self.id_column.clone());
        }
        let placeholders = vec!["?"; columns.len()].join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table_name,
            columns.join(", "),
            placeholders
        )
    }

    /// `None` when the entity has no updatable columns.
    pub fn update_sql(&self) -> Option<String> {
        let columns = self.columns();
        if columns.is_empty() {
            return None;
        }
        let assignments: Vec<String> = columns.iter().map(|c| format!("{} = ?", c)).collect();
        Some(format!(
            "UPDATE {} SET {} WHERE {} = ?",
            self.table_name,
            assignments.join(", "),
            self.id_column
        ))
    }

    pub fn delete_sql(&self) -> String {
        format!("DELETE FROM {} WHERE {} = ?", self.table_name, self.id_column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_persister() -> EntityPersister {
        EntityPersister::new("Order", "orders")
            .property(Property::basic("total"))
            .property(Property::many_to_one("customer", "Customer").not_null())
            .property(Property::collection("lines", "Order.lines"))
            .property(Property::component(
                "shipping",
                ComponentType::new()
                    .property("street", Type::Basic)
                    .property("city", Type::Basic),
            ))
    }

    #[test]
    fn test_insert_sql_skips_collections_and_flattens_components() {
        let persister = order_persister();
        assert_eq!(
            persister.insert_sql(true),
            "INSERT INTO orders (id, total, customer_id, shipping_street, shipping_city) VALUES (?, ?, ?, ?, ?)"
        );
        assert_eq!(
            persister.insert_sql(false),
            "INSERT INTO orders (total, customer_id, shipping_street, shipping_city) VALUES (?, ?, ?, ?)"
        );
    }

    #[test]
    fn test_update_and_delete_sql() {
        let persister = order_persister();
        assert_eq!(
            persister.update_sql().unwrap(),
            "UPDATE orders SET total = ?, customer_id = ?, shipping_street = ?, shipping_city = ? WHERE id = ?"
        );
        assert_eq!(persister.delete_sql(), "DELETE FROM orders WHERE id = ?");
        assert!(EntityPersister::new("Tag", "tags").update_sql().is_none());
    }

    #[test]
    fn test_dehydrate_binds_association_identifiers() {
        let persister = order_persister();
        let customer = crate::core::EntityInstance::with_id("Customer", 9i64, vec![]);
        let params = persister.dehydrate(&[
            Value::Integer(100),
            Value::Entity(customer),
            Value::Null,
            Value::Component(vec![Value::from("Main St"), Value::from("Springfield")]),
        ]);
        assert_eq!(
            params,
            vec![
                Value::Integer(100),
                Value::Integer(9),
                Value::from("Main St"),
                Value::from("Springfield"),
            ]
        );
    }

    #[test]
    fn test_defaults() {
        let persister = EntityPersister::new("Cat", "animals").root_entity("Animal");
        assert_eq!(persister.root_entity_name(), "Animal");
        assert_eq!(persister.query_spaces().to_vec(), vec!["animals".to_string()]);
        assert!(!persister.uses_identity());
        assert!(persister.is_mutable());
    }
}
