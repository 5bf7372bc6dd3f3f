// ============================================================================
// Mapping types
// ============================================================================
//
// The subset of type metadata the write path inspects: whether a property is
// a plain value, an association to another entity, a collection, or an
// embedded component made of further typed sub-properties.
//
// ============================================================================

/// Side of a one-to-one association that holds the foreign key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeignKeyDirection {
    /// The owning row references the associated row.
    FromParent,
    /// The associated row references the owning row.
    ToParent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Basic,
    Entity(EntityType),
    Collection(CollectionType),
    Component(ComponentType),
}

impl Type {
    pub fn many_to_one(entity_name: impl Into<String>) -> Self {
        Type::Entity(EntityType::many_to_one(entity_name))
    }

    pub fn one_to_one(entity_name: impl Into<String>, direction: ForeignKeyDirection) -> Self {
        Type::Entity(EntityType::one_to_one(entity_name, direction))
    }

    pub fn collection(role: impl Into<String>) -> Self {
        Type::Collection(CollectionType::new(role))
    }

    pub fn is_entity_type(&self) -> bool {
        matches!(self, Type::Entity(_))
    }

    pub fn is_collection_type(&self) -> bool {
        matches!(self, Type::Collection(_))
    }

    pub fn is_component_type(&self) -> bool {
        matches!(self, Type::Component(_))
    }

    /// Number of columns this type occupies in its owner's table.
    pub fn column_span(&self) -> usize {
        match self {
            Type::Basic | Type::Entity(_) => 1,
            Type::Collection(_) => 0,
            Type::Component(component) => component.subtypes().iter().map(Type::column_span).sum(),
        }
    }
}

/// Association to another entity
#[derive(Debug, Clone, PartialEq)]
pub struct EntityType {
    associated_entity_name: String,
    one_to_one: Option<ForeignKeyDirection>,
    reference_to_primary_key: bool,
}

impl EntityType {
    pub fn many_to_one(entity_name: impl Into<String>) -> Self {
        Self {
            associated_entity_name: entity_name.into(),
            one_to_one: None,
            reference_to_primary_key: true,
        }
    }

    /// A one-to-one joined through a unique key; use
    /// [`EntityType::referencing_primary_key`] for shared primary keys.
    pub fn one_to_one(entity_name: impl Into<String>, direction: ForeignKeyDirection) -> Self {
        Self {
            associated_entity_name: entity_name.into(),
            one_to_one: Some(direction),
            reference_to_primary_key: false,
        }
    }

    pub fn referencing_primary_key(mut self) -> Self {
        self.reference_to_primary_key = true;
        self
    }

    pub fn associated_entity_name(&self) -> &str {
        &self.associated_entity_name
    }

    pub fn is_one_to_one(&self) -> bool {
        self.one_to_one.is_some()
    }

    pub fn foreign_key_direction(&self) -> ForeignKeyDirection {
        self.one_to_one.unwrap_or(ForeignKeyDirection::FromParent)
    }

    pub fn is_reference_to_primary_key(&self) -> bool {
        self.reference_to_primary_key
    }
}

/// Collection-valued property; details live on the collection persister
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionType {
    role: String,
}

impl CollectionType {
    pub fn new(role: impl Into<String>) -> Self {
        Self { role: role.into() }
    }

    pub fn role(&self) -> &str {
        &self.role
    }
}

/// Embedded value made of named, typed sub-properties
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ComponentType {
    property_names: Vec<String>,
    subtypes: Vec<Type>,
    nullability: Vec<bool>,
}

impl ComponentType {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn property(mut self, name: impl Into<String>, ty: Type) -> Self {
        self.property_names.push(name.into());
        self.subtypes.push(ty);
        self.nullability.push(true);
        self
    }

    pub fn not_null_property(mut self, name: impl Into<String>, ty: Type) -> Self {
        self.property_names.push(name.into());
        self.subtypes.push(ty);
        self.nullability.push(false);
        self
    }

    pub fn property_names(&self) -> &[String] {
        &self.property_names
    }

    pub fn subtypes(&self) -> &[Type] {
        &self.subtypes
    }

    pub fn property_nullability(&self) -> &[bool] {
        &self.nullability
    }
}
