use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "associated_car")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub device_id: Uuid,
    pub name: Option<String>,
    #[sea_orm(unique)]
    pub mac_address: String,
    pub encrypted_session: Vec<u8>,
    pub encrypted_identification_key: Vec<u8>,
    pub user_renamed: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
